//! The event loop and per-client I/O orchestration (§4.1, §4.5-§4.6).
//!
//! The emulator state machine itself (§4.4) lives in [`crate::client`] as
//! pure methods on `EmulatorInfo`; this module only classifies incoming
//! objects, feeds them to that state machine, and carries out whatever
//! [`crate::client::EmulatorAction`] comes back - socket writes, the
//! terminate sequence, the forced-cleanup sweep.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::client::{Client, ClientKind, EmulatorAction, EmulatorInfo, QMP_CAPABILITIES, QUIT_FRAME};
use crate::hook;
use crate::identity;
use crate::pidfd::{self, PidFd};
use crate::reader::{self, ClientEvent};

/// Upper bound on how long the event loop ever blocks while forced-cleanup
/// work is pending, so the deadline sweep always runs even if something
/// keeps re-arming a deadline further out (§4.1).
const MAX_SWEEP_WAIT: Duration = Duration::from_secs(10);

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct Daemon {
    listener: tokio::net::UnixListener,
    clients: HashMap<RawFd, Client>,
    /// vmid -> fd of the registered emulator client (§3 Registry).
    registry: HashMap<String, RawFd>,
    /// fds whose termination has been initiated, in the order it started
    /// (§3 Forced-cleanup list).
    forced_cleanup: Vec<RawFd>,
    kill_timeout: Duration,
    hook_path: PathBuf,
    events_tx: mpsc::Sender<ClientEvent>,
    events_rx: mpsc::Receiver<ClientEvent>,
}

impl Daemon {
    pub fn new(listener: tokio::net::UnixListener, kill_timeout: Duration, hook_path: PathBuf) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Daemon {
            listener,
            clients: HashMap::new(),
            registry: HashMap::new(),
            forced_cleanup: Vec::new(),
            kill_timeout,
            hook_path,
            events_tx,
            events_rx,
        }
    }

    /// Runs until `SIGTERM`/`SIGINT` requests an orderly shutdown. The
    /// daemon itself has no persisted state to flush (§6: "Persisted
    /// state: None") - exiting just stops accepting new work; in-flight
    /// client sockets close with the process.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = sigterm.recv() => {
                    log::info!("received SIGTERM, shutting down");
                    return Ok(());
                }
                _ = sigint.recv() => {
                    log::info!("received SIGINT, shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    self.handle_accept(accepted).await;
                    self.sweep_forced_cleanup();
                }
                Some(event) = self.events_rx.recv() => {
                    match event {
                        ClientEvent::Object(fd, value) => self.handle_object(fd, value).await,
                        ClientEvent::Eof(fd) => self.cleanup_client(fd).await,
                    }
                    self.sweep_forced_cleanup();
                }
                _ = sleep_bounded(deadline) => {
                    self.sweep_forced_cleanup();
                }
            }
        }
    }

    async fn handle_accept(&mut self, accepted: std::io::Result<(tokio::net::UnixStream, tokio::net::unix::SocketAddr)>) {
        let conn = match accepted {
            Ok((conn, _addr)) => conn,
            Err(err) => {
                log::warn!("accept failed: {err}");
                return;
            }
        };
        let fd = conn.as_raw_fd();
        let (rx, tx) = tokio::io::split(conn);
        self.clients.insert(fd, Client::new(fd, tx));
        tokio::spawn(reader::run(fd, rx, self.events_tx.clone()));
    }

    async fn handle_object(&mut self, fd: RawFd, value: Value) {
        log::debug!("fd={fd} <- {value}");
        let Some(obj) = value.as_object() else {
            return;
        };

        // Classified by the first recognized key, in this fixed order
        // (§4.2).
        if obj.contains_key("QMP") {
            self.handle_handshake(fd).await;
        } else if let Some(name) = obj.get("event").and_then(Value::as_str) {
            self.handle_qmp_event(fd, name, obj.get("data")).await;
        } else if obj.contains_key("return") {
            self.handle_qmp_return(fd, obj.get("return")).await;
        } else if let Some(error) = obj.get("error") {
            self.handle_qmp_error(fd, error);
        } else if obj.contains_key("vzdump") {
            self.handle_vzdump(fd, obj).await;
        }
    }

    async fn handle_handshake(&mut self, fd: RawFd) {
        let is_unknown = matches!(self.clients.get(&fd).map(|c| &c.kind), Some(ClientKind::Unknown));
        if !is_unknown {
            return;
        }

        let pid = match identity::peer_pid(fd) {
            Some(pid) => pid,
            None => {
                log::warn!("fd={fd}: could not read peer credentials, closing");
                self.clients.remove(&fd);
                return;
            }
        };

        let vmid = match identity::resolve_vmid(pid) {
            Some(vmid) => vmid,
            None => {
                log::warn!("pid={pid}: could not resolve vmid from cgroup, closing fd={fd}");
                self.clients.remove(&fd);
                return;
            }
        };

        let mut info = EmulatorInfo::new(vmid.clone(), pid);
        if self.registry.contains_key(&vmid) {
            log::warn!("vmid {vmid}: duplicate emulator registration, keeping the existing client");
        } else {
            self.registry.insert(vmid.clone(), fd);
            info.registered = true;
        }

        if let Some(client) = self.clients.get_mut(&fd) {
            client.kind = ClientKind::Emulator(info);
        }
        if !self.send_frame(fd, QMP_CAPABILITIES).await {
            // Not the `quit` frame, so the fallback is "close the client"
            // rather than a signal escalation (§4.7).
            self.cleanup_client(fd).await;
        }
    }

    async fn handle_vzdump(&mut self, fd: RawFd, obj: &serde_json::Map<String, Value>) {
        let is_unknown = matches!(self.clients.get(&fd).map(|c| &c.kind), Some(ClientKind::Unknown));
        if !is_unknown {
            return;
        }

        let vmid = match obj
            .get("vzdump")
            .and_then(|v| v.get("vmid"))
            .and_then(Value::as_str)
        {
            Some(vmid) => vmid.to_string(),
            None => {
                log::debug!("fd={fd}: vzdump handshake missing vmid, ignoring");
                return;
            }
        };

        let Some(&target_fd) = self.registry.get(&vmid) else {
            // Stays kind=unknown, no backup effect (§4.3).
            return;
        };

        if let Some(client) = self.clients.get_mut(&fd) {
            client.kind = ClientKind::Backup(crate::client::BackupInfo { vmid: vmid.clone() });
        }
        if let Some(target) = self.clients.get_mut(&target_fd).and_then(Client::as_emulator_mut) {
            target.backup_in_progress = true;
        }
    }

    async fn handle_qmp_event(&mut self, fd: RawFd, name: &str, data: Option<&Value>) {
        let guest = data.and_then(|d| d.get("guest")).and_then(Value::as_bool);
        let action = match self.clients.get_mut(&fd).and_then(Client::as_emulator_mut) {
            Some(info) => info.on_event(name, guest),
            None => return,
        };
        self.apply_action(fd, action).await;
    }

    async fn handle_qmp_return(&mut self, fd: RawFd, ret: Option<&Value>) {
        let status = ret.and_then(|r| r.get("status")).and_then(Value::as_str);
        let action = match self.clients.get_mut(&fd).and_then(Client::as_emulator_mut) {
            Some(info) => info.on_return(status),
            None => return,
        };
        self.apply_action(fd, action).await;
    }

    fn handle_qmp_error(&mut self, fd: RawFd, error: &Value) {
        let Some(info) = self.clients.get_mut(&fd).and_then(Client::as_emulator_mut) else {
            return;
        };
        let desc = error.get("desc").and_then(Value::as_str).unwrap_or("<no description>");
        log::warn!("vmid {}: QMP error: {desc}", info.vmid);
        info.on_error();
    }

    /// Coalesces concurrent termination triggers: only one `query-status`
    /// is ever in flight per client.
    async fn termination_check(&mut self, fd: RawFd) {
        let action = match self.clients.get_mut(&fd).and_then(Client::as_emulator_mut) {
            Some(info) => info.termination_check(),
            None => return,
        };
        self.apply_action(fd, action).await;
    }

    /// Runs whatever an `EmulatorInfo` transition asked for: a frame
    /// write (closing the client if it fails, §4.7), a logged spurious
    /// return, or the terminate sequence.
    async fn apply_action(&mut self, fd: RawFd, action: EmulatorAction) {
        match action {
            EmulatorAction::None => {}
            EmulatorAction::Send(frame) => {
                if !self.send_frame(fd, frame).await {
                    // Not the `quit` frame, so a failed write here closes
                    // the client outright rather than falling back to a
                    // signal (§4.7).
                    self.cleanup_client(fd).await;
                }
            }
            EmulatorAction::SpuriousReturn => {
                if let Some(info) = self.clients.get(&fd).and_then(Client::as_emulator) {
                    log::warn!("vmid {}: spurious return", info.vmid);
                }
            }
            EmulatorAction::BeginTerminate => self.terminate(fd).await,
        }
    }

    async fn terminate(&mut self, fd: RawFd) {
        let (pid, vmid) = {
            let Some(info) = self.clients.get_mut(&fd).and_then(Client::as_emulator_mut) else {
                return;
            };
            info.begin_terminate();
            (info.pid, info.vmid.clone())
        };

        let pidfd = match PidFd::open(pid) {
            Ok(pidfd) => pidfd,
            Err(err) => {
                log::warn!("vmid {vmid}: pidfd_open failed: {err}");
                None
            }
        };

        if !self.send_frame(fd, QUIT_FRAME).await {
            if let Err(err) = nix::sys::signal::kill(pid, Signal::SIGTERM) {
                log::warn!("vmid {vmid}: SIGTERM failed: {err}");
            }
        }

        if let Some(info) = self.clients.get_mut(&fd).and_then(Client::as_emulator_mut) {
            info.arm_deadline(pidfd, Instant::now() + self.kill_timeout);
        }
        self.forced_cleanup.push(fd);
    }

    async fn cleanup_client(&mut self, fd: RawFd) {
        let Some(client) = self.clients.remove(&fd) else {
            return;
        };
        match client.kind {
            ClientKind::Emulator(info) => self.finish_emulator_cleanup(fd, info),
            ClientKind::Backup(info) => self.finish_backup_cleanup(info).await,
            ClientKind::Unknown => {}
        }
    }

    fn finish_emulator_cleanup(&mut self, fd: RawFd, info: EmulatorInfo) {
        if info.registered {
            self.registry.remove(&info.vmid);
        }
        self.forced_cleanup.retain(|&f| f != fd);
        // info.pidfd is dropped here, closing the descriptor.
        hook::spawn(&self.hook_path, &info.vmid, info.graceful, info.guest_initiated);
    }

    async fn finish_backup_cleanup(&mut self, info: crate::client::BackupInfo) {
        let Some(&target_fd) = self.registry.get(&info.vmid) else {
            return;
        };
        let action = match self.clients.get_mut(&target_fd).and_then(Client::as_emulator_mut) {
            Some(target) => target.backup_ended(),
            None => return,
        };
        self.apply_action(target_fd, action).await;
    }

    fn sweep_forced_cleanup(&mut self) {
        let now = Instant::now();
        let clients = &self.clients;
        let due = due_for_kill(
            &mut self.forced_cleanup,
            |fd| clients.get(&fd).and_then(Client::as_emulator).and_then(|info| info.deadline),
            now,
        );

        for fd in due {
            if let Some(info) = self.clients.get(&fd).and_then(Client::as_emulator) {
                if let Err(err) = pidfd::send_signal(info.pidfd.as_ref(), info.pid, Signal::SIGKILL) {
                    log::warn!("vmid {}: SIGKILL failed: {err}", info.vmid);
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.forced_cleanup
            .iter()
            .filter_map(|fd| self.clients.get(fd).and_then(Client::as_emulator).and_then(|i| i.deadline))
            .min()
    }

    async fn send_frame(&mut self, fd: RawFd, frame: &'static [u8]) -> bool {
        let Some(client) = self.clients.get_mut(&fd) else {
            return false;
        };
        match client.tx.write_all(frame).await {
            Ok(()) => true,
            Err(err) => {
                log::debug!("fd={fd}: write failed, closing: {err}");
                false
            }
        }
    }
}

/// Pure selection step of §4.6's forced-cleanup sweep: given the current
/// forced-cleanup list and each client's deadline, returns the fds whose
/// kill should be issued now and removes them from `forced_cleanup` so a
/// later call never re-selects the same fd (P6: exactly one kill attempt
/// per client per deadline expiry). A client with no deadline on record
/// is treated as due - that only happens for an fd left in the list
/// inconsistently, and blocking the sweep on it forever would be worse.
fn due_for_kill(
    forced_cleanup: &mut Vec<RawFd>,
    deadline_of: impl Fn(RawFd) -> Option<Instant>,
    now: Instant,
) -> Vec<RawFd> {
    let due: Vec<RawFd> = forced_cleanup
        .iter()
        .copied()
        .filter(|&fd| deadline_of(fd).map(|deadline| now >= deadline).unwrap_or(true))
        .collect();

    let due_set: std::collections::HashSet<RawFd> = due.iter().copied().collect();
    forced_cleanup.retain(|fd| !due_set.contains(fd));
    due
}

async fn sleep_bounded(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            let bound = Instant::now() + MAX_SWEEP_WAIT;
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline.min(bound))).await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_fires_exactly_one_kill_per_client_after_deadline() {
        // P6: the deadline sweep never fires before `deadline`, and after
        // it, the next sweep issues exactly one kill attempt per client.
        let now = Instant::now();
        let mut forced_cleanup: Vec<RawFd> = vec![10, 11];
        let deadline_of = |fd: RawFd| match fd {
            10 => Some(now - Duration::from_secs(1)),
            11 => Some(now + Duration::from_secs(30)),
            _ => None,
        };

        let due = due_for_kill(&mut forced_cleanup, deadline_of, now);
        assert_eq!(due, vec![10]);
        assert_eq!(forced_cleanup, vec![11]);

        // A second sweep at the same instant must not re-select fd 10:
        // it has already been removed from the forced-cleanup list.
        let due_again = due_for_kill(&mut forced_cleanup, deadline_of, now);
        assert!(due_again.is_empty());
    }

    #[test]
    fn sweep_does_not_fire_before_the_deadline() {
        let now = Instant::now();
        let mut forced_cleanup: Vec<RawFd> = vec![7];
        let due = due_for_kill(&mut forced_cleanup, |_| Some(now + Duration::from_secs(5)), now);
        assert!(due.is_empty());
        assert_eq!(forced_cleanup, vec![7]);
    }

    #[test]
    fn sweep_treats_a_missing_deadline_as_due() {
        let now = Instant::now();
        let mut forced_cleanup: Vec<RawFd> = vec![5];
        let due = due_for_kill(&mut forced_cleanup, |_| None, now);
        assert_eq!(due, vec![5]);
        assert!(forced_cleanup.is_empty());
    }
}
