//! Kernel process supervisor.
//!
//! Owns the one kernel link, the readiness gate, the outbound backlog and the
//! bounded restart policy. All methods run on the dispatch loop; nothing here
//! is shared across tasks.

use std::collections::VecDeque;

use pocketrag_protocol::{encode_line, Envelope, SessionId};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::kernel::{ExitReason, KernelError, KernelEvent, KernelLauncher, KernelLink};
use crate::ready_gate::ReadyGate;
use crate::session_registry::{BoundResource, SessionRegistry};

pub const DEFAULT_MAX_RESTARTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Ready,
    Running,
    Crashed,
    Restarting,
    Stopped,
    Fatal,
}

impl SupervisorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Fatal)
    }
}

/// What triggered a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCause {
    /// The kernel exited with a non-zero code.
    Crash,
    /// Spawn failure or a `kernelServerCrashed` report.
    KernelError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted,
    /// No windows left to serve.
    Quit,
    /// Restart budget exhausted. `first` is true only the first time this is reported.
    Fatal { first: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Stale generation, or a kill the supervisor asked for.
    Ignored,
    /// Exit code 0.
    CleanShutdown,
    Crashed,
}

pub struct Supervisor {
    launcher: Box<dyn KernelLauncher>,
    events_tx: mpsc::Sender<KernelEvent>,
    max_restarts: u32,
    state: SupervisorState,
    generation: u64,
    link: Option<KernelLink>,
    restart_count: u32,
    gate: ReadyGate,
    backlog: VecDeque<Envelope>,
    /// Bound sessions captured when the last ready kernel went away.
    reopen: Option<Vec<(SessionId, BoundResource)>>,
    fatal_reported: bool,
}

impl Supervisor {
    pub fn new(
        launcher: Box<dyn KernelLauncher>,
        events_tx: mpsc::Sender<KernelEvent>,
        max_restarts: u32,
    ) -> Self {
        Self {
            launcher,
            events_tx,
            max_restarts,
            state: SupervisorState::NotStarted,
            generation: 0,
            link: None,
            restart_count: 0,
            gate: ReadyGate::new(),
            backlog: VecDeque::new(),
            reopen: None,
            fatal_reported: false,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn is_running(&self) -> bool {
        self.link.is_some()
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_open() && self.link.is_some()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Resolves once the current (or next) kernel is ready.
    pub fn wait_ready(&mut self) -> oneshot::Receiver<()> {
        self.gate.wait()
    }

    /// Spawn the first kernel.
    pub fn start(&mut self) -> Result<(), KernelError> {
        self.spawn()
    }

    fn spawn(&mut self) -> Result<(), KernelError> {
        self.generation += 1;
        self.gate.renew();
        self.state = SupervisorState::Starting;
        match self.launcher.launch(self.generation, self.events_tx.clone()) {
            Ok(link) => {
                self.link = Some(link);
                Ok(())
            }
            Err(e) => {
                error!(
                    component = "supervisor",
                    event = "supervisor.spawn_failed",
                    generation = self.generation,
                    error = %e,
                    "Failed to start kernel"
                );
                self.link = None;
                Err(e)
            }
        }
    }

    /// Classify an exit report from the launcher.
    pub fn handle_exit(&mut self, generation: u64, reason: ExitReason) -> ExitOutcome {
        if generation != self.generation {
            debug!(
                component = "supervisor",
                event = "supervisor.exit.stale",
                generation,
                current = self.generation,
                "Ignoring exit of a replaced kernel"
            );
            return ExitOutcome::Ignored;
        }

        match reason {
            ExitReason::Requested => ExitOutcome::Ignored,
            ExitReason::Exited { code, signal } => {
                self.link = None;
                if code == Some(0) {
                    info!(
                        component = "supervisor",
                        event = "supervisor.kernel.stopped",
                        generation,
                        "Kernel exited cleanly"
                    );
                    self.state = SupervisorState::Stopped;
                    ExitOutcome::CleanShutdown
                } else {
                    warn!(
                        component = "supervisor",
                        event = "supervisor.kernel.crashed",
                        generation,
                        code = ?code,
                        signal = ?signal,
                        "Kernel crashed"
                    );
                    self.state = SupervisorState::Crashed;
                    ExitOutcome::Crashed
                }
            }
        }
    }

    /// Apply the bounded restart policy. Spawn failures retry in place as kernel errors.
    pub fn restart(&mut self, cause: RestartCause, sessions: &SessionRegistry) -> RestartOutcome {
        let mut cause = cause;
        loop {
            self.restart_count += 1;

            if sessions.is_empty() && cause != RestartCause::KernelError {
                info!(
                    component = "supervisor",
                    event = "supervisor.restart.no_windows",
                    restart_count = self.restart_count,
                    "No windows open, not restarting kernel"
                );
                self.kill();
                self.state = SupervisorState::Stopped;
                return RestartOutcome::Quit;
            }

            if self.restart_count > self.max_restarts {
                self.kill();
                self.state = SupervisorState::Fatal;
                let first = !self.fatal_reported;
                self.fatal_reported = true;
                error!(
                    component = "supervisor",
                    event = "supervisor.restart.exhausted",
                    restart_count = self.restart_count,
                    max_restarts = self.max_restarts,
                    "Kernel restarted too many times"
                );
                return RestartOutcome::Fatal { first };
            }

            info!(
                component = "supervisor",
                event = "supervisor.restart",
                restart_count = self.restart_count,
                cause = ?cause,
                "Restarting kernel"
            );
            self.state = SupervisorState::Restarting;

            // Requests sent to a kernel that never became ready are still in the backlog.
            if self.gate.is_open() {
                self.reopen = Some(sessions.bound_sessions());
            }
            self.kill();

            match self.spawn() {
                Ok(()) => return RestartOutcome::Restarted,
                Err(_) => cause = RestartCause::KernelError,
            }
        }
    }

    /// Final stop on host exit. A fatal state is kept for reporting.
    pub fn shutdown(&mut self) {
        self.kill();
        if self.state != SupervisorState::Fatal {
            self.state = SupervisorState::Stopped;
        }
    }

    /// Kill the current kernel, if any. Its exit arrives as `ExitReason::Requested`.
    pub fn kill(&mut self) {
        if let Some(link) = self.link.take() {
            debug!(
                component = "supervisor",
                event = "supervisor.kill",
                generation = link.generation(),
                "Killing kernel"
            );
            link.kill();
        }
    }

    /// Open the gate for `generation` and write the acknowledgement ahead of anything queued.
    ///
    /// Returns the sessions whose repositories must be reopened, filtered to those
    /// still bound to the same repository.
    pub async fn mark_ready(
        &mut self,
        generation: u64,
        announcement: &Envelope,
        sessions: &SessionRegistry,
    ) -> Vec<(SessionId, BoundResource)> {
        if generation != self.generation || self.link.is_none() {
            return Vec::new();
        }
        if !self.gate.open() {
            warn!(
                component = "supervisor",
                event = "supervisor.ready.duplicate",
                generation,
                "Kernel announced readiness twice"
            );
            return Vec::new();
        }
        self.state = SupervisorState::Ready;
        info!(
            component = "supervisor",
            event = "supervisor.ready",
            generation,
            "Kernel ready"
        );

        if let Err(e) = self.write_direct(&announcement.acknowledge()).await {
            warn!(
                component = "supervisor",
                event = "supervisor.ready.ack_failed",
                generation,
                error = %e,
                "Failed to acknowledge readiness"
            );
        }

        self.reopen
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|(id, resource)| {
                sessions
                    .get(*id)
                    .and_then(|s| s.resource.as_ref())
                    .is_some_and(|bound| bound == resource)
            })
            .collect()
    }

    /// Drain the backlog in order, then mark the kernel running.
    pub async fn flush_backlog(&mut self) {
        let queued = self.backlog.len();
        while let Some(envelope) = self.backlog.pop_front() {
            if let Err(e) = self.write_direct(&envelope).await {
                warn!(
                    component = "supervisor",
                    event = "supervisor.backlog.flush_failed",
                    callback_id = envelope.callback_id,
                    error = %e,
                    "Backlog flush interrupted"
                );
                self.backlog.push_front(envelope);
                return;
            }
        }
        if queued > 0 {
            debug!(
                component = "supervisor",
                event = "supervisor.backlog.flushed",
                count = queued,
                "Flushed outbound backlog"
            );
        }
        if self.state == SupervisorState::Ready {
            self.state = SupervisorState::Running;
        }
    }

    /// Send an envelope to the kernel, queueing it until the kernel is ready.
    ///
    /// Nothing overtakes the backlog: while it holds anything, new writes join it.
    pub async fn write(&mut self, envelope: Envelope) {
        if !self.is_ready() || !self.backlog.is_empty() {
            debug!(
                component = "supervisor",
                event = "supervisor.write.queued",
                callback_id = envelope.callback_id,
                message_type = %envelope.message.kind,
                backlog = self.backlog.len(),
                "Queueing envelope"
            );
            self.backlog.push_back(envelope);
            return;
        }
        if let Err(e) = self.write_direct(&envelope).await {
            warn!(
                component = "supervisor",
                event = "supervisor.write.failed",
                callback_id = envelope.callback_id,
                error = %e,
                "Write to kernel failed, queueing envelope"
            );
            self.backlog.push_back(envelope);
        }
    }

    async fn write_direct(&self, envelope: &Envelope) -> Result<(), KernelError> {
        let link = self.link.as_ref().ok_or(KernelError::StdinClosed)?;
        let line = encode_line(envelope)?;
        link.write_line(line).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_registry::WindowHandle;
    use crate::test_support::{ready_envelope, FakeLauncher};
    use pocketrag_protocol::{Message, MessageKind, WindowKind};

    fn supervisor(launcher: FakeLauncher) -> (Supervisor, mpsc::Receiver<KernelEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (Supervisor::new(Box::new(launcher), tx, DEFAULT_MAX_RESTARTS), rx)
    }

    fn one_window(sessions: &mut SessionRegistry) -> SessionId {
        let (tx, _rx) = mpsc::channel(8);
        sessions.create_session(WindowHandle::new(WindowKind::Main, tx))
    }

    #[tokio::test]
    async fn writes_before_ready_are_backlogged_then_flushed_after_ack() {
        let mut launcher = FakeLauncher::new();
        let mut kernels = launcher.kernels();
        let (mut sup, _events) = supervisor(launcher);
        let sessions = SessionRegistry::new();

        sup.start().unwrap();
        sup.write(Envelope::global_request(5, Message::new(MessageKind::GetRepos)))
            .await;
        assert_eq!(sup.backlog_len(), 1);

        let mut kernel = kernels.next().await;
        sup.mark_ready(kernel.generation, &ready_envelope(), &sessions).await;
        sup.flush_backlog().await;
        assert_eq!(sup.state(), SupervisorState::Running);

        let ack = kernel.next_envelope().await;
        assert!(ack.is_reply);
        assert!(ack.is_success());
        let queued = kernel.next_envelope().await;
        assert_eq!(queued.callback_id, 5);
        assert_eq!(sup.backlog_len(), 0);
    }

    #[tokio::test]
    async fn zero_exit_is_clean_and_requested_exit_is_ignored() {
        let launcher = FakeLauncher::new();
        let (mut sup, _events) = supervisor(launcher);
        sup.start().unwrap();
        let gen = sup.generation();

        assert_eq!(sup.handle_exit(gen, ExitReason::Requested), ExitOutcome::Ignored);
        let stale = ExitReason::Exited {
            code: Some(1),
            signal: None,
        };
        assert_eq!(sup.handle_exit(gen + 7, stale), ExitOutcome::Ignored);
        assert_eq!(
            sup.handle_exit(gen, ExitReason::Exited { code: Some(0), signal: None }),
            ExitOutcome::CleanShutdown
        );
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn crash_without_windows_quits() {
        let launcher = FakeLauncher::new();
        let (mut sup, _events) = supervisor(launcher);
        let sessions = SessionRegistry::new();
        sup.start().unwrap();

        assert_eq!(sup.restart(RestartCause::Crash, &sessions), RestartOutcome::Quit);
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn fourth_restart_is_fatal_and_reported_once() {
        let launcher = FakeLauncher::new();
        let launches = launcher.launch_count();
        let (mut sup, _events) = supervisor(launcher);
        let mut sessions = SessionRegistry::new();
        one_window(&mut sessions);
        sup.start().unwrap();

        for _ in 0..3 {
            assert_eq!(sup.restart(RestartCause::Crash, &sessions), RestartOutcome::Restarted);
        }
        assert_eq!(
            sup.restart(RestartCause::Crash, &sessions),
            RestartOutcome::Fatal { first: true }
        );
        assert_eq!(
            sup.restart(RestartCause::KernelError, &sessions),
            RestartOutcome::Fatal { first: false }
        );
        assert_eq!(launches.get(), 4);
        assert_eq!(sup.state(), SupervisorState::Fatal);
    }

    #[tokio::test]
    async fn spawn_failures_consume_the_budget_without_recursion() {
        let launcher = FakeLauncher::failing();
        let launches = launcher.launch_count();
        let (mut sup, _events) = supervisor(launcher);
        let sessions = SessionRegistry::new();

        assert!(sup.start().is_err());
        assert_eq!(
            sup.restart(RestartCause::KernelError, &sessions),
            RestartOutcome::Fatal { first: true }
        );
        // initial start plus three retries
        assert_eq!(launches.get(), 4);
        assert!(!sup.is_running());
    }

    #[tokio::test]
    async fn failed_write_keeps_later_writes_behind_it() {
        let mut launcher = FakeLauncher::new();
        let mut kernels = launcher.kernels();
        let (mut sup, _events) = supervisor(launcher);
        let mut sessions = SessionRegistry::new();
        one_window(&mut sessions);

        sup.start().unwrap();
        let mut first = kernels.next().await;
        sup.mark_ready(first.generation, &ready_envelope(), &sessions).await;
        sup.flush_backlog().await;
        first.next_envelope().await;

        first.close_stdin();
        for callback_id in [11, 12, 13] {
            sup.write(Envelope::global_request(
                callback_id,
                Message::new(MessageKind::GetRepos),
            ))
            .await;
        }
        assert_eq!(sup.backlog_len(), 3);

        assert_eq!(sup.restart(RestartCause::Crash, &sessions), RestartOutcome::Restarted);
        let mut second = kernels.next().await;
        sup.mark_ready(second.generation, &ready_envelope(), &sessions).await;
        sup.flush_backlog().await;

        assert!(second.next_envelope().await.is_reply);
        for expected in [11, 12, 13] {
            assert_eq!(second.next_envelope().await.callback_id, expected);
        }
        assert_eq!(sup.backlog_len(), 0);
    }
}
