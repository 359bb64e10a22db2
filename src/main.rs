//! Per-host VM lifecycle supervisor daemon (§1, §2).

mod args;
mod client;
mod daemon;
mod hook;
mod identity;
mod listener;
mod pidfd;
mod protocol;
mod reader;
mod signals;

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::unistd::{fork, ForkResult};

use args::Args;
use daemon::Daemon;

/// The post-termination hook binary (§6). Not part of the command-line
/// surface in §6 - the hook script's own configuration-file schema is
/// one of the external collaborators §1 declares out of scope, so its
/// path is fixed here rather than threaded through as a flag.
const HOOK_PATH: &str = "/usr/share/qmeventd/qmeventd.sh";

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    syslog::init(syslog::Facility::LOG_DAEMON, level, Some("qmeventd"))
        .map_err(|err| anyhow::format_err!("{err}"))
        .context("failed to initialize syslog")
}

/// Detaches from the controlling terminal unless `-f` was given. A plain
/// single fork + `setsid` - unlike `proxmox-rest-server`'s daemon
/// reload machinery this process has no listening sockets to hand off
/// across a restart, so there is nothing to synchronize with the parent
/// beyond letting it exit immediately.
fn daemonize() -> Result<()> {
    match unsafe { fork() }.context("failed to fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    nix::unistd::setsid().context("failed to create new session")?;

    let dev_null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("failed to open /dev/null")?;
    let fd = dev_null.as_raw_fd();
    for target in [0, 1, 2] {
        nix::unistd::dup2(fd, target).context("failed to redirect standard stream")?;
    }

    Ok(())
}

fn run(args: Args) -> Result<()> {
    init_logging(args.verbose)?;

    if !args.foreground {
        daemonize()?;
    }

    signals::ignore_sigchld()?;

    let socket_path = args.socket_path.clone();
    let kill_timeout = Duration::from_secs(args.kill_timeout_secs);
    let hook_path = PathBuf::from(HOOK_PATH);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(async move {
        let listener = listener::bind_unix_listener(&socket_path)?;
        log::info!("listening on {}", socket_path.display());
        Daemon::new(listener, kill_timeout, hook_path).run().await
    })
}

fn main() {
    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(args) {
        log::error!("{err:#}");
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}
