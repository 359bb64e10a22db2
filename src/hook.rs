//! Post-termination hook invocation (§4.6, §6).
//!
//! `exec <hook> cleanup <vmid> <0|1> <0|1>`. The daemon never waits on the
//! child - `SIGCHLD` is set to `SIG_IGN` at startup (see [`crate::signals`])
//! so the kernel reaps it without our involvement, matching "the hook's
//! exit status is not collected".

use std::path::Path;
use std::process::Command;

/// Forks and execs the hook. Synchronous - a `fork`+`execve` pair returns
/// in microseconds and the single-threaded event loop can afford the
/// brief stall; spinning up tokio's child-process machinery for a
/// fire-and-forget exec we never wait on would be pure overhead.
pub fn spawn(hook: &Path, vmid: &str, graceful: bool, guest_initiated: bool) {
    let graceful_arg = if graceful { "1" } else { "0" };
    let guest_arg = if guest_initiated { "1" } else { "0" };

    match Command::new(hook)
        .arg("cleanup")
        .arg(vmid)
        .arg(graceful_arg)
        .arg(guest_arg)
        .spawn()
    {
        // The handle is dropped without waiting - SIGCHLD is SIG_IGN (see
        // crate::signals), so the kernel reaps the child for us.
        Ok(_child) => {}
        Err(err) => {
            log::error!(
                "vmid {vmid}: failed to spawn termination hook {}: {err}",
                hook.display()
            );
        }
    }
}
