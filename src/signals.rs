//! Process-wide signal disposition (§5).
//!
//! `SIGCHLD` is ignored so every hook invocation is auto-reaped by the
//! kernel; we never call `wait()` anywhere in this daemon.

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

pub fn ignore_sigchld() -> Result<()> {
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }
        .context("failed to set SIGCHLD to SIG_IGN")?;
    Ok(())
}
