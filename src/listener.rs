//! Listener setup (§4.1).
//!
//! A stream socket in the unix domain, bound to a filesystem path with a
//! backlog of 10. Built with raw `socket`/`bind`/`listen` (mirroring the
//! vsock setup in the sibling restore-daemon binary) rather than
//! `tokio::net::UnixListener::bind`, because the standard library/tokio
//! convenience constructor does not expose a way to set the backlog.

use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;

use anyhow::{Context, Result};
use nix::sys::socket::{bind, listen, socket, AddressFamily, SockFlag, SockType, UnixAddr};

const LISTEN_BACKLOG: usize = 10;

pub fn bind_unix_listener(path: &Path) -> Result<tokio::net::UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).context("failed to remove stale socket path"),
    }

    let fd: RawFd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("failed to create unix domain socket")?;

    let addr = UnixAddr::new(path).context("invalid socket path")?;
    bind(fd, &addr).context("failed to bind control socket")?;
    listen(fd, LISTEN_BACKLOG).context("failed to listen on control socket")?;

    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
    std_listener
        .set_nonblocking(true)
        .context("failed to set listener non-blocking")?;
    tokio::net::UnixListener::from_std(std_listener).context("failed to register listener with runtime")
}
