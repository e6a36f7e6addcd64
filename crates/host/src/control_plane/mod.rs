//! The dispatch loop.
//!
//! One task owns the call registry, the session registry, the supervisor and
//! the repository watchers. It consumes kernel events (decoded envelopes in
//! arrival order, exit reports) and host commands (window traffic, file
//! events, quit) one at a time, so no state here needs a lock.

mod router;
mod window_requests;

use std::path::{Path, PathBuf};

use pocketrag_protocol::{
    CallbackId, DialogLevel, Envelope, Message, MessageKind, SessionId, Status, WindowEvent,
    WindowKind, WindowRequest,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::call_registry::{CallRegistry, Continuation};
use crate::kernel::{KernelEvent, KernelLauncher};
use crate::session_registry::{Delivery, SessionRegistry, WindowHandle};
use crate::state::{HostSnapshot, SharedSnapshot};
use crate::supervisor::{ExitOutcome, RestartCause, RestartOutcome, Supervisor};
use crate::watcher::RepoWatchers;

const FATAL_MESSAGE: &str = "kernel restarted too many times, so the program is about to shut";

/// Inputs to the dispatch loop from outside the kernel.
#[derive(Debug)]
pub enum HostCommand {
    OpenWindow {
        kind: WindowKind,
        events: mpsc::Sender<WindowEvent>,
        reply: oneshot::Sender<SessionId>,
    },
    CloseWindow {
        session_id: SessionId,
    },
    Window {
        session_id: SessionId,
        request: WindowRequest,
    },
    RepoFileChanged {
        repo_path: PathBuf,
    },
    Quit,
}

/// Why the dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// The kernel exited with code 0 on its own.
    KernelStopped,
    /// The kernel crashed with no windows left to serve.
    NoWindows,
    /// Restart budget exhausted.
    Fatal,
    /// Requested by the host (signal or closed command channel).
    Quit,
}

impl ExitCause {
    pub fn exit_code(self) -> u8 {
        match self {
            ExitCause::Fatal => 1,
            _ => 0,
        }
    }
}

pub(crate) enum Flow {
    Continue,
    Exit(ExitCause),
}

/// Files the loop writes on behalf of windows.
#[derive(Debug, Clone)]
pub struct PlaneConfig {
    pub max_restarts: u32,
    pub settings_path: PathBuf,
    pub modified_settings_path: PathBuf,
}

pub struct ControlPlane {
    calls: CallRegistry,
    sessions: SessionRegistry,
    supervisor: Supervisor,
    watchers: RepoWatchers,
    snapshot: SharedSnapshot,
    config: PlaneConfig,
    /// Callback id of the `stopAll` sent on quit.
    stopping: Option<CallbackId>,
    /// Windows whose event queue filled up, destroyed after the current handler.
    stalled: Vec<SessionId>,
}

impl ControlPlane {
    /// Build the loop. The returned receiver carries kernel events into `run`.
    pub fn new(
        launcher: Box<dyn KernelLauncher>,
        config: PlaneConfig,
        commands: mpsc::Sender<HostCommand>,
        snapshot: SharedSnapshot,
    ) -> (Self, mpsc::Receiver<KernelEvent>) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let plane = Self {
            calls: CallRegistry::new(),
            sessions: SessionRegistry::new(),
            supervisor: Supervisor::new(launcher, events_tx, config.max_restarts),
            watchers: RepoWatchers::new(commands),
            snapshot,
            config,
            stopping: None,
            stalled: Vec::new(),
        };
        (plane, events_rx)
    }

    /// Start the kernel and process events until the host should exit.
    pub async fn run(
        mut self,
        mut kernel_rx: mpsc::Receiver<KernelEvent>,
        mut commands: mpsc::Receiver<HostCommand>,
    ) -> ExitCause {
        let mut flow = match self.supervisor.start() {
            Ok(()) => Flow::Continue,
            Err(_) => self.restart(RestartCause::KernelError).await,
        };
        let mut commands_open = true;

        let cause = loop {
            self.reap_stalled().await;
            self.publish_snapshot();
            if let Flow::Exit(cause) = flow {
                break cause;
            }

            flow = tokio::select! {
                biased;
                Some(event) = kernel_rx.recv() => self.handle_kernel_event(event).await,
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        commands_open = false;
                        self.begin_shutdown().await
                    }
                },
                else => Flow::Exit(ExitCause::Quit),
            };
        };

        self.finish(cause).await;
        cause
    }

    async fn handle_kernel_event(&mut self, event: KernelEvent) -> Flow {
        if event.generation() != self.supervisor.generation() {
            debug!(
                component = "control_plane",
                event = "control_plane.kernel_event.stale",
                generation = event.generation(),
                current = self.supervisor.generation(),
                "Dropping event from a replaced kernel"
            );
            return Flow::Continue;
        }

        match event {
            KernelEvent::Envelope {
                generation,
                envelope,
            } => self.route(generation, envelope).await,
            KernelEvent::Exited { generation, reason } => {
                match self.supervisor.handle_exit(generation, reason) {
                    ExitOutcome::Ignored => Flow::Continue,
                    _ if self.stopping.is_some() => Flow::Exit(ExitCause::Quit),
                    ExitOutcome::CleanShutdown => Flow::Exit(ExitCause::KernelStopped),
                    ExitOutcome::Crashed => self.restart(RestartCause::Crash).await,
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: HostCommand) -> Flow {
        match cmd {
            HostCommand::OpenWindow {
                kind,
                events,
                reply,
            } => {
                let window = WindowHandle::new(kind, events);
                let session_id = self.sessions.create_session(window);
                info!(
                    component = "control_plane",
                    event = "window.opened",
                    session_id,
                    kind = ?kind,
                    "Window connected"
                );
                if reply.send(session_id).is_err() {
                    self.destroy_session(session_id).await;
                    return Flow::Continue;
                }
                let kernel_ready = self.supervisor.is_ready();
                self.notify(
                    session_id,
                    WindowEvent::Hello {
                        window_id: session_id,
                        kind,
                        kernel_ready,
                    },
                );
                Flow::Continue
            }
            HostCommand::CloseWindow { session_id } => {
                self.destroy_session(session_id).await;
                Flow::Continue
            }
            HostCommand::Window {
                session_id,
                request,
            } => {
                if self.sessions.get(session_id).is_none() {
                    warn!(
                        component = "control_plane",
                        event = "window.request.unknown_session",
                        session_id,
                        request = request.name(),
                        "Request from a window that is not registered"
                    );
                    return Flow::Continue;
                }
                self.handle_window_request(session_id, request).await;
                Flow::Continue
            }
            HostCommand::RepoFileChanged { repo_path } => {
                for session_id in self.sessions.sessions_at_path(&repo_path) {
                    self.notify(session_id, WindowEvent::RepoFileChanged);
                }
                Flow::Continue
            }
            HostCommand::Quit => self.begin_shutdown().await,
        }
    }

    /// Remove a window: drop its calls, tell the kernel to close its repository, drop its watches.
    async fn destroy_session(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.destroy_session(session_id) else {
            debug!(
                component = "control_plane",
                event = "window.close.unknown",
                session_id,
                "Close for a window that is already gone"
            );
            return;
        };

        let discarded = self.calls.discard_for_session(session_id);
        info!(
            component = "control_plane",
            event = "window.closed",
            session_id,
            discarded_calls = discarded,
            "Window closed"
        );

        if let Some(resource) = session.resource {
            let message = Message::new(MessageKind::CloseRepo).with("sessionId", session_id);
            self.send_global(None, message, None).await;
            self.watchers.unwatch(Path::new(&resource.path));
        }
        self.watchers.release(session_id);
    }

    async fn restart(&mut self, cause: RestartCause) -> Flow {
        match self.supervisor.restart(cause, &self.sessions) {
            RestartOutcome::Restarted => Flow::Continue,
            RestartOutcome::Quit => Flow::Exit(ExitCause::NoWindows),
            RestartOutcome::Fatal { first } => {
                if first {
                    self.broadcast(WindowEvent::Fatal {
                        message: FATAL_MESSAGE.to_string(),
                    });
                }
                Flow::Exit(ExitCause::Fatal)
            }
        }
    }

    /// Ask the kernel to stop. The loop ends on its reply or its exit.
    async fn begin_shutdown(&mut self) -> Flow {
        if self.stopping.is_some() {
            return Flow::Continue;
        }
        if !self.supervisor.is_running() {
            return Flow::Exit(ExitCause::Quit);
        }
        info!(
            component = "control_plane",
            event = "control_plane.shutdown.begin",
            "Stopping kernel"
        );
        let callback_id = self
            .send_global(None, Message::new(MessageKind::StopAll), None)
            .await;
        self.stopping = Some(callback_id);
        Flow::Continue
    }

    async fn finish(&mut self, cause: ExitCause) {
        self.supervisor.shutdown();
        self.watchers.clear();
        self.broadcast(WindowEvent::Close {
            reason: "host shutting down".to_string(),
        });
        self.publish_snapshot();
        info!(
            component = "control_plane",
            event = "control_plane.exit",
            cause = ?cause,
            "Dispatch loop finished"
        );
    }

    /// Register a control-plane call and write it.
    async fn send_global(
        &mut self,
        owner: Option<SessionId>,
        message: Message,
        continuation: Option<Continuation>,
    ) -> CallbackId {
        let callback_id = self.calls.register_for(owner, continuation);
        debug!(
            component = "control_plane",
            event = "kernel.request.global",
            callback_id,
            message_type = %message.kind,
            "Sending global request"
        );
        self.supervisor
            .write(Envelope::global_request(callback_id, message))
            .await;
        callback_id
    }

    /// Register a call on a window's session and write it.
    async fn send_session(&mut self, session_id: SessionId, message: Message) -> CallbackId {
        let callback_id = self.calls.register_for(Some(session_id), None);
        debug!(
            component = "control_plane",
            event = "kernel.request.session",
            session_id,
            callback_id,
            message_type = %message.kind,
            "Sending session request"
        );
        self.supervisor
            .write(Envelope::session_request(session_id, callback_id, message))
            .await;
        callback_id
    }

    fn notify(&mut self, session_id: SessionId, event: WindowEvent) -> bool {
        match self.sessions.lookup(session_id) {
            Some(window) => push_event(window, session_id, event, &mut self.stalled),
            None => {
                warn!(
                    component = "control_plane",
                    event = "window.not_found",
                    session_id,
                    "Window not found for session"
                );
                false
            }
        }
    }

    fn broadcast(&mut self, event: WindowEvent) {
        for (session_id, window) in self.sessions.windows() {
            push_event(window, session_id, event.clone(), &mut self.stalled);
        }
    }

    /// Drop windows that stopped draining their queue, so they cannot hold up the loop.
    async fn reap_stalled(&mut self) {
        let mut stalled = std::mem::take(&mut self.stalled);
        stalled.sort_unstable();
        stalled.dedup();
        for session_id in stalled {
            warn!(
                component = "control_plane",
                event = "window.stalled",
                session_id,
                "Window is not reading its events, closing it"
            );
            self.destroy_session(session_id).await;
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot.store(std::sync::Arc::new(HostSnapshot {
            state: self.supervisor.state(),
            generation: self.supervisor.generation(),
            restart_count: self.supervisor.restart_count(),
            kernel_ready: self.supervisor.is_ready(),
            windows: self.sessions.len(),
            bound_windows: self.sessions.bound_sessions().len(),
            pending_calls: self.calls.len(),
            backlog: self.supervisor.backlog_len(),
            watched_paths: self.watchers.len(),
        }));
    }
}

/// Push one event to a window. A full queue marks the window stalled.
pub(super) fn push_event(
    window: &WindowHandle,
    session_id: SessionId,
    event: WindowEvent,
    stalled: &mut Vec<SessionId>,
) -> bool {
    match window.deliver(event) {
        Delivery::Sent => true,
        Delivery::Full => {
            stalled.push(session_id);
            false
        }
        Delivery::Closed => false,
    }
}

/// Runs when an `openRepo` reply arrives: on failure the window gets the error and is closed.
fn open_repo_outcome(session_id: SessionId, events: mpsc::Sender<WindowEvent>) -> Continuation {
    Box::new(move |reply: &Envelope| {
        if reply.is_success() {
            return;
        }
        let status = reply
            .status
            .clone()
            .unwrap_or_else(|| Status::error("UNKNOWN", "openRepo reply without status"));
        warn!(
            component = "control_plane",
            event = "repo.open.failed",
            session_id,
            code = %status.code,
            message = %status.message,
            "Kernel failed to open repository"
        );
        let _ = events.try_send(WindowEvent::Dialog {
            level: DialogLevel::Error,
            title: status.code,
            message: status.message,
        });
        let _ = events.try_send(WindowEvent::Close {
            reason: "repository could not be opened".to_string(),
        });
    })
}
