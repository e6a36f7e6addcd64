//! Shared application state

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::control_plane::HostCommand;
use crate::supervisor::SupervisorState;

/// Point-in-time view of the control plane, published after every command.
#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub state: SupervisorState,
    pub generation: u64,
    pub restart_count: u32,
    pub kernel_ready: bool,
    pub windows: usize,
    pub bound_windows: usize,
    pub pending_calls: usize,
    pub backlog: usize,
    pub watched_paths: usize,
}

impl Default for HostSnapshot {
    fn default() -> Self {
        Self {
            state: SupervisorState::NotStarted,
            generation: 0,
            restart_count: 0,
            kernel_ready: false,
            windows: 0,
            bound_windows: 0,
            pending_calls: 0,
            backlog: 0,
            watched_paths: 0,
        }
    }
}

/// Lock-free snapshot cell shared between the dispatch loop and HTTP handlers.
pub type SharedSnapshot = Arc<ArcSwap<HostSnapshot>>;

pub fn shared_snapshot() -> SharedSnapshot {
    Arc::new(ArcSwap::from_pointee(HostSnapshot::default()))
}

/// State handed to every HTTP handler
#[derive(Clone)]
pub struct HttpState {
    pub commands: mpsc::Sender<HostCommand>,
    pub snapshot: SharedSnapshot,
}

impl HttpState {
    pub fn new(commands: mpsc::Sender<HostCommand>, snapshot: SharedSnapshot) -> Self {
        Self { commands, snapshot }
    }

    pub fn snapshot(&self) -> Arc<HostSnapshot> {
        self.snapshot.load_full()
    }
}
