//! Per-connection state (§3 DATA MODEL) and the emulator client's pure
//! state-machine transitions (§4.4).
//!
//! The transition methods on [`EmulatorInfo`] take no socket, no pidfd
//! syscall, nothing but `&mut self` and the event's payload; they return
//! an [`EmulatorAction`] describing what the caller - `daemon.rs`, which
//! does own the socket - still has to do. That split is what lets the
//! state machine run in plain unit tests with no accepted connection
//! anywhere in sight.

use std::os::unix::io::RawFd;
use std::time::Instant;

use nix::unistd::Pid;
use tokio::io::WriteHalf;
use tokio::net::UnixStream;

use crate::pidfd::PidFd;

/// Kill timeout default, in seconds, when `-t` is not given.
pub const DEFAULT_KILL_TIMEOUT_SECS: u64 = 60;

/// Outbound wire frames the state machine sends (§6).
pub const QMP_CAPABILITIES: &[u8] = b"{\"execute\":\"qmp_capabilities\"}\n";
pub const QUERY_STATUS: &[u8] = b"{\"execute\":\"query-status\"}\n";
pub const QUIT_FRAME: &[u8] = b"{\"execute\":\"quit\"}\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorState {
    Handshake,
    Idle,
    ExpectStatusResponse,
    Terminating,
}

/// What a state-machine transition asks its caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulatorAction {
    /// Nothing to do.
    None,
    /// Write this frame to the client's socket.
    Send(&'static [u8]),
    /// A `return` arrived with nothing outstanding - logged by the
    /// caller, not acted on.
    SpuriousReturn,
    /// The VM is not active and nothing else holds it up: run §4.4's
    /// terminate sequence (pidfd, quit/SIGTERM fallback, deadline).
    BeginTerminate,
}

pub struct EmulatorInfo {
    pub vmid: String,
    pub pid: Pid,
    pub state: EmulatorState,
    pub graceful: bool,
    pub guest_initiated: bool,
    pub backup_in_progress: bool,
    pub termination_queued: bool,
    pub pidfd: Option<PidFd>,
    pub deadline: Option<Instant>,
    /// Whether this client ended up in the registry (false on a vmid
    /// collision - it still runs the state machine, it just isn't
    /// addressable by backup clients, per §4.7).
    pub registered: bool,
}

impl EmulatorInfo {
    pub fn new(vmid: String, pid: Pid) -> Self {
        EmulatorInfo {
            vmid,
            pid,
            state: EmulatorState::Handshake,
            graceful: false,
            guest_initiated: false,
            backup_in_progress: false,
            termination_queued: false,
            pidfd: None,
            deadline: None,
            registered: false,
        }
    }

    /// §4.4 termination-check: coalesces concurrent triggers so at most
    /// one `query-status` is ever in flight per client (I2).
    pub fn termination_check(&mut self) -> EmulatorAction {
        if self.state != EmulatorState::Idle {
            self.termination_queued = true;
            return EmulatorAction::None;
        }
        self.state = EmulatorState::ExpectStatusResponse;
        EmulatorAction::Send(QUERY_STATUS)
    }

    fn rerun_queued_termination_check(&mut self) -> EmulatorAction {
        if std::mem::take(&mut self.termination_queued) {
            self.termination_check()
        } else {
            EmulatorAction::None
        }
    }

    /// §4.4 QMP-event handling. Events in `Terminating` are ignored; only
    /// `SHUTDOWN` has any effect (I1: a second `SHUTDOWN` is a no-op on
    /// top of the first, since `graceful`/`guest_initiated` just get
    /// overwritten with the same kind of value).
    pub fn on_event(&mut self, name: &str, guest: Option<bool>) -> EmulatorAction {
        if self.state == EmulatorState::Terminating || name != "SHUTDOWN" {
            return EmulatorAction::None;
        }
        self.graceful = true;
        if let Some(guest) = guest {
            self.guest_initiated = guest;
        }
        self.termination_check()
    }

    /// §4.4 QMP-return handling. `status` is the return object's `status`
    /// field, meaningful only in `ExpectStatusResponse`.
    pub fn on_return(&mut self, status: Option<&str>) -> EmulatorAction {
        match self.state {
            EmulatorState::Handshake => {
                self.state = EmulatorState::Idle;
                EmulatorAction::None
            }
            // The empty return to our `quit` request - accepted silently.
            EmulatorState::Terminating => EmulatorAction::None,
            EmulatorState::Idle => EmulatorAction::SpuriousReturn,
            EmulatorState::ExpectStatusResponse => {
                let active = matches!(status, Some("running") | Some("paused"));
                self.state = EmulatorState::Idle;
                if !active && !self.backup_in_progress {
                    EmulatorAction::BeginTerminate
                } else {
                    self.rerun_queued_termination_check()
                }
            }
        }
    }

    /// §4.4 QMP-error handling. A late error must not un-terminate a
    /// client already on the forced-cleanup path, so the transition back
    /// to `Idle` is suppressed while `Terminating`.
    pub fn on_error(&mut self) {
        if self.state != EmulatorState::Terminating {
            self.state = EmulatorState::Idle;
        }
    }

    /// §4.5: the backup referencing this client has ended. Clears the
    /// flag and reconsiders any shutdown observed during the backup.
    pub fn backup_ended(&mut self) -> EmulatorAction {
        self.backup_in_progress = false;
        self.termination_check()
    }

    /// §4.4 terminate: moves to `Terminating`. The caller still has to
    /// attempt the quit write / SIGTERM fallback, open a pidfd, and arm
    /// the deadline with [`EmulatorInfo::arm_deadline`] - those are the
    /// impure parts of `terminate`.
    pub fn begin_terminate(&mut self) {
        self.state = EmulatorState::Terminating;
    }

    /// Records the outcome of the impure part of terminate: the pidfd
    /// (if one could be opened) and the forced-cleanup deadline.
    pub fn arm_deadline(&mut self, pidfd: Option<PidFd>, deadline: Instant) {
        self.pidfd = pidfd;
        self.deadline = Some(deadline);
    }
}

pub struct BackupInfo {
    /// vmid this backup client refers to, by value only - never a pointer
    /// or key into the client table, so a stale reference just fails an
    /// eventual lookup instead of dangling.
    pub vmid: String,
}

pub enum ClientKind {
    Unknown,
    Emulator(EmulatorInfo),
    Backup(BackupInfo),
}

pub struct Client {
    pub fd: RawFd,
    pub tx: WriteHalf<UnixStream>,
    pub kind: ClientKind,
}

impl Client {
    pub fn new(fd: RawFd, tx: WriteHalf<UnixStream>) -> Self {
        Client {
            fd,
            tx,
            kind: ClientKind::Unknown,
        }
    }

    pub fn as_emulator(&self) -> Option<&EmulatorInfo> {
        match &self.kind {
            ClientKind::Emulator(info) => Some(info),
            _ => None,
        }
    }

    pub fn as_emulator_mut(&mut self) -> Option<&mut EmulatorInfo> {
        match &mut self.kind {
            ClientKind::Emulator(info) => Some(info),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_info() -> EmulatorInfo {
        EmulatorInfo::new("100".to_string(), Pid::from_raw(1234))
    }

    #[test]
    fn handshake_through_expect_status_to_terminating() {
        let mut info = new_info();
        assert_eq!(info.state, EmulatorState::Handshake);

        // qmp_capabilities return: handshake -> idle.
        assert_eq!(info.on_return(None), EmulatorAction::None);
        assert_eq!(info.state, EmulatorState::Idle);

        // SHUTDOWN observed: idle -> expect-status-response, query-status sent.
        let action = info.on_event("SHUTDOWN", Some(true));
        assert_eq!(action, EmulatorAction::Send(QUERY_STATUS));
        assert_eq!(info.state, EmulatorState::ExpectStatusResponse);
        assert!(info.graceful);
        assert!(info.guest_initiated);

        // query-status reports a non-active VM: terminate.
        let action = info.on_return(Some("shutdown"));
        assert_eq!(action, EmulatorAction::BeginTerminate);
        info.begin_terminate();
        assert_eq!(info.state, EmulatorState::Terminating);
    }

    #[test]
    fn events_and_returns_are_ignored_once_terminating() {
        let mut info = new_info();
        info.begin_terminate();
        assert_eq!(info.on_event("SHUTDOWN", None), EmulatorAction::None);
        assert_eq!(info.on_return(Some("running")), EmulatorAction::None);
        assert_eq!(info.state, EmulatorState::Terminating);
    }

    #[test]
    fn second_shutdown_is_idempotent_with_first() {
        // I1: receiving two SHUTDOWN events is equivalent to receiving one.
        let mut a = new_info();
        a.on_return(None);
        a.on_event("SHUTDOWN", Some(false));

        let mut b = new_info();
        b.on_return(None);
        b.on_event("SHUTDOWN", Some(false));
        b.on_event("SHUTDOWN", Some(false));

        assert_eq!(a.state, b.state);
        assert_eq!(a.graceful, b.graceful);
        assert_eq!(a.guest_initiated, b.guest_initiated);
    }

    #[test]
    fn termination_check_coalesces_while_not_idle() {
        // I2: a termination-check that arrives while one is already in
        // flight is coalesced, not issued as a second query-status.
        let mut info = new_info();
        info.on_return(None); // -> idle
        assert_eq!(info.termination_check(), EmulatorAction::Send(QUERY_STATUS));
        assert_eq!(info.state, EmulatorState::ExpectStatusResponse);

        assert_eq!(info.termination_check(), EmulatorAction::None);
        assert!(info.termination_queued);
    }

    #[test]
    fn queued_termination_check_reruns_after_leaving_expect_status() {
        let mut info = new_info();
        info.on_return(None);
        info.termination_check();
        info.termination_check(); // coalesced while in flight

        // Comes back active: no terminate, but the queued check re-fires.
        let action = info.on_return(Some("running"));
        assert_eq!(action, EmulatorAction::Send(QUERY_STATUS));
        assert_eq!(info.state, EmulatorState::ExpectStatusResponse);
        assert!(!info.termination_queued);
    }

    #[test]
    fn no_terminate_while_backup_in_progress() {
        // P5: while backup_in_progress, a non-active query-status result
        // must not terminate.
        let mut info = new_info();
        info.on_return(None);
        info.backup_in_progress = true;
        info.on_event("SHUTDOWN", Some(false));

        let action = info.on_return(Some("shutdown"));
        assert_eq!(action, EmulatorAction::None);
        assert_eq!(info.state, EmulatorState::Idle);
    }

    #[test]
    fn terminate_fires_once_backup_clears_after_shutdown() {
        // P5: when the flag falls to false, a terminate occurs iff a
        // SHUTDOWN was previously observed and query-status then reports
        // a non-active state.
        let mut info = new_info();
        info.on_return(None);
        info.backup_in_progress = true;
        info.on_event("SHUTDOWN", Some(false));
        info.on_return(Some("shutdown")); // held back by the backup

        let action = info.backup_ended();
        assert_eq!(action, EmulatorAction::Send(QUERY_STATUS));
        let action = info.on_return(Some("shutdown"));
        assert_eq!(action, EmulatorAction::BeginTerminate);
    }

    #[test]
    fn spurious_return_while_idle_is_reported_and_ignored() {
        let mut info = new_info();
        info.on_return(None); // -> idle
        let action = info.on_return(Some("running"));
        assert_eq!(action, EmulatorAction::SpuriousReturn);
        assert_eq!(info.state, EmulatorState::Idle);
    }

    #[test]
    fn error_returns_to_idle_but_not_from_terminating() {
        let mut info = new_info();
        info.on_return(None);
        info.state = EmulatorState::ExpectStatusResponse;
        info.on_error();
        assert_eq!(info.state, EmulatorState::Idle);

        info.begin_terminate();
        info.on_error();
        assert_eq!(info.state, EmulatorState::Terminating);
    }
}
