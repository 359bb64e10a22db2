//! Thin wrapper around the `pidfd_open(2)`/`pidfd_send_signal(2)` syscalls.
//!
//! `nix` does not yet expose these (added to the kernel in 5.3/5.1), so we
//! call them directly through `libc::syscall`, the same way the rest of
//! this workspace reaches for raw syscalls that have no safe wrapper yet.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

#[cfg(target_arch = "x86_64")]
const SYS_PIDFD_OPEN: libc::c_long = 434;
#[cfg(target_arch = "x86_64")]
const SYS_PIDFD_SEND_SIGNAL: libc::c_long = 424;

#[cfg(target_arch = "aarch64")]
const SYS_PIDFD_OPEN: libc::c_long = 434;
#[cfg(target_arch = "aarch64")]
const SYS_PIDFD_SEND_SIGNAL: libc::c_long = 424;

/// An open process descriptor. Closed on drop.
#[derive(Debug)]
pub struct PidFd(RawFd);

impl PidFd {
    /// Opens a process descriptor for `pid`. Returns `Ok(None)` when the
    /// kernel doesn't implement the syscall (`ENOSYS`) and `Err` for
    /// anything else except `ESRCH`, which is also folded into `Ok(None)`
    /// since the process is simply already gone by the time we looked.
    pub fn open(pid: Pid) -> Result<Option<Self>, Errno> {
        let rc = unsafe { libc::syscall(SYS_PIDFD_OPEN, pid.as_raw(), 0) };
        if rc >= 0 {
            return Ok(Some(PidFd(rc as RawFd)));
        }
        match Errno::last() {
            Errno::ENOSYS | Errno::ESRCH => Ok(None),
            other => Err(other),
        }
    }

    /// Sends `signal` through the descriptor. `ESRCH` (process already
    /// reaped) is treated as success by the caller, not here, so that both
    /// the pidfd and plain-pid send paths share one policy.
    pub fn send_signal(&self, signal: Signal) -> Result<(), Errno> {
        let rc = unsafe {
            libc::syscall(
                SYS_PIDFD_SEND_SIGNAL,
                self.0,
                signal as libc::c_int,
                std::ptr::null::<libc::siginfo_t>(),
                0,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(Errno::last())
        }
    }
}

impl Drop for PidFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Sends `signal` to `pid` via its process descriptor when available,
/// falling back to a plain `kill(2)`. `ESRCH` is treated as success in both
/// cases - the target is already gone, which is exactly what we wanted.
pub fn send_signal(pidfd: Option<&PidFd>, pid: Pid, signal: Signal) -> Result<(), Errno> {
    let result = match pidfd {
        Some(fd) => fd.send_signal(signal),
        None => nix::sys::signal::kill(pid, signal),
    };
    match result {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}
