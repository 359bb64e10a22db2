//! Command-line surface (§6): one positional, three flags.
//!
//! A small hand-rolled argv scanner rather than a schema-driven parser -
//! the surface is four flags and a positional and does not warrant the
//! `proxmox-router`/`proxmox-schema` machinery the larger API binaries
//! in this workspace pull in.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

pub struct Args {
    pub socket_path: PathBuf,
    pub foreground: bool,
    pub verbose: bool,
    pub kill_timeout_secs: u64,
}

const USAGE: &str = "\
usage: qmeventd [-f] [-v] [-t <seconds>] <socket-path>

  -f              run in the foreground (default: detach)
  -v              verbose logging
  -t <seconds>    kill timeout, must be > 0 (default: 60)
  -h              print this help and exit
";

impl Args {
    pub fn parse<I: IntoIterator<Item = String>>(argv: I) -> Result<Self> {
        let mut foreground = false;
        let mut verbose = false;
        let mut kill_timeout_secs = crate::client::DEFAULT_KILL_TIMEOUT_SECS;
        let mut socket_path = None;

        let mut args = argv.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-f" => foreground = true,
                "-v" => verbose = true,
                "-h" => {
                    print!("{USAGE}");
                    std::process::exit(0);
                }
                "-t" => {
                    let value = args.next().context("-t requires an argument")?;
                    let secs: u64 = value
                        .parse()
                        .with_context(|| format!("invalid -t value {value:?}"))?;
                    if secs == 0 {
                        bail!("-t must be > 0");
                    }
                    kill_timeout_secs = secs;
                }
                "--" => {
                    if socket_path.is_some() {
                        bail!("unexpected extra argument after socket path");
                    }
                    socket_path = args.next().map(PathBuf::from);
                }
                other if other.starts_with('-') && other != "-" => {
                    bail!("unrecognized flag {other:?}\n{USAGE}");
                }
                other => {
                    if socket_path.is_some() {
                        bail!("unexpected extra argument {other:?}");
                    }
                    socket_path = Some(PathBuf::from(other));
                }
            }
        }

        let socket_path = socket_path.context(format!("missing socket path\n{USAGE}"))?;

        Ok(Args {
            socket_path,
            foreground,
            verbose,
            kill_timeout_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_socket_path_only() {
        let args = Args::parse(argv(&["/run/qmeventd.sock"])).unwrap();
        assert_eq!(args.socket_path, PathBuf::from("/run/qmeventd.sock"));
        assert!(!args.foreground);
        assert!(!args.verbose);
        assert_eq!(args.kill_timeout_secs, crate::client::DEFAULT_KILL_TIMEOUT_SECS);
    }

    #[test]
    fn parses_all_flags() {
        let args = Args::parse(argv(&["-f", "-v", "-t", "5", "/run/qmeventd.sock"])).unwrap();
        assert!(args.foreground);
        assert!(args.verbose);
        assert_eq!(args.kill_timeout_secs, 5);
        assert_eq!(args.socket_path, PathBuf::from("/run/qmeventd.sock"));
    }

    #[test]
    fn rejects_zero_timeout() {
        assert!(Args::parse(argv(&["-t", "0", "/run/qmeventd.sock"])).is_err());
    }

    #[test]
    fn rejects_missing_socket_path() {
        assert!(Args::parse(argv(&["-f"])).is_err());
    }

    #[test]
    fn rejects_unknown_flag() {
        assert!(Args::parse(argv(&["--bogus", "/run/qmeventd.sock"])).is_err());
    }
}
