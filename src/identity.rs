//! Resolving a freshly-connected emulator's vmid.
//!
//! Combines the peer pid obtained from `SO_PEERCRED` with the cgroup
//! membership recorded in `/proc/<pid>/cgroup`: the cgroup path is the
//! sole, authoritative source used here. A legacy cmdline-based lookup
//! is deliberately not implemented; a failed cgroup resolution is only
//! logged with the pid for manual follow-up (see DESIGN.md).

use std::os::unix::io::RawFd;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use nix::unistd::Pid;

const QEMU_SLICE: &str = "/qemu.slice/";
const SCOPE_SUFFIX: &str = ".scope";

/// Maximum length of a decimal vmid string (matches the source daemon's
/// fixed-size vmid buffer).
pub const MAX_VMID_LEN: usize = 15;

/// Reads the pid of the process on the other end of `fd` via `SO_PEERCRED`.
pub fn peer_pid(fd: RawFd) -> Option<Pid> {
    let cred = getsockopt(fd, PeerCredentials {}).ok()?;
    Some(Pid::from_raw(cred.pid()))
}

/// Resolves the vmid of `pid` by reading `/proc/<pid>/cgroup` and picking
/// the entry whose path contains `/qemu.slice/`, extracting the numeric
/// prefix of the terminal path segment before the `.scope` suffix.
pub fn resolve_vmid(pid: Pid) -> Option<String> {
    let path = format!("/proc/{}/cgroup", pid);
    let contents = std::fs::read_to_string(path).ok()?;
    contents.lines().find_map(vmid_from_cgroup_line)
}

fn vmid_from_cgroup_line(line: &str) -> Option<String> {
    let idx = line.find(QEMU_SLICE)?;
    let rest = &line[idx + QEMU_SLICE.len()..];
    let segment = rest.rsplit('/').next().unwrap_or(rest);
    let stem = segment.strip_suffix(SCOPE_SUFFIX).unwrap_or(segment);
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() > MAX_VMID_LEN {
        None
    } else {
        Some(digits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_vmid_from_cgroup_v2_line() {
        assert_eq!(
            vmid_from_cgroup_line("0::/qemu.slice/101.scope"),
            Some("101".to_string())
        );
    }

    #[test]
    fn extracts_vmid_from_cgroup_v1_line() {
        assert_eq!(
            vmid_from_cgroup_line("1:name=systemd:/qemu.slice/202.scope"),
            Some("202".to_string())
        );
    }

    #[test]
    fn ignores_unrelated_lines() {
        assert_eq!(vmid_from_cgroup_line("4:pids:/user.slice/user-0.slice"), None);
    }

    #[test]
    fn rejects_missing_numeric_prefix() {
        assert_eq!(
            vmid_from_cgroup_line("0::/qemu.slice/monitor.scope"),
            None
        );
    }

    #[test]
    fn finds_first_matching_line_among_several() {
        let doc = "12:cpuset:/\n1:name=systemd:/qemu.slice/303.scope\n0::/qemu.slice/303.scope\n";
        assert_eq!(doc.lines().find_map(vmid_from_cgroup_line), Some("303".to_string()));
    }
}
