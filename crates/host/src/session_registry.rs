//! Window sessions: which window owns which session id, and which repository it has open.

use std::collections::BTreeMap;
use std::path::Path;

use pocketrag_protocol::{SessionId, WindowEvent, WindowKind};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::ids::IdSequence;

/// Push channel to one connected window.
#[derive(Debug, Clone)]
pub struct WindowHandle {
    kind: WindowKind,
    events: mpsc::Sender<WindowEvent>,
}

impl WindowHandle {
    pub fn new(kind: WindowKind, events: mpsc::Sender<WindowEvent>) -> Self {
        Self { kind, events }
    }

    pub fn kind(&self) -> WindowKind {
        self.kind
    }

    /// Clone of the push channel, for callers that deliver later (continuations, ready waiters).
    pub fn sender(&self) -> mpsc::Sender<WindowEvent> {
        self.events.clone()
    }

    /// Deliver an event without waiting on the window.
    pub fn deliver(&self, event: WindowEvent) -> Delivery {
        match self.events.try_send(event) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Result of pushing one event to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The window is not draining its queue.
    Full,
    /// The window's connection is gone.
    Closed,
}

/// The repository a window has open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundResource {
    pub name: String,
    pub path: String,
}

#[derive(Debug)]
pub struct WindowSession {
    pub id: SessionId,
    pub window: WindowHandle,
    pub resource: Option<BoundResource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    Unchanged,
    NotFound,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, WindowSession>,
    ids: IdSequence,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(&mut self, window: WindowHandle) -> SessionId {
        let id = self.ids.next_id();
        self.sessions.insert(
            id,
            WindowSession {
                id,
                window,
                resource: None,
            },
        );
        id
    }

    /// Attach a repository to a session. Binding the same values twice is a no-op.
    pub fn bind_resource(
        &mut self,
        session_id: SessionId,
        resource_name: &str,
        resource_path: &str,
    ) -> BindOutcome {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return BindOutcome::NotFound;
        };
        let resource = BoundResource {
            name: resource_name.to_string(),
            path: resource_path.to_string(),
        };
        if session.resource.as_ref() == Some(&resource) {
            return BindOutcome::Unchanged;
        }
        debug!(
            component = "session_registry",
            event = "session.bound",
            session_id,
            repo_name = %resource.name,
            "Repository bound to window"
        );
        session.resource = Some(resource);
        BindOutcome::Bound
    }

    pub fn lookup(&self, session_id: SessionId) -> Option<&WindowHandle> {
        self.sessions.get(&session_id).map(|s| &s.window)
    }

    pub fn get(&self, session_id: SessionId) -> Option<&WindowSession> {
        self.sessions.get(&session_id)
    }

    /// The session that has `resource_name` open, if any.
    pub fn lookup_by_resource(&self, resource_name: &str) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.resource.as_ref().is_some_and(|r| r.name == resource_name))
            .map(|s| s.id)
    }

    /// Sessions whose bound repository lives at `path`.
    pub fn sessions_at_path(&self, path: &Path) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.resource.as_ref().is_some_and(|r| Path::new(&r.path) == path))
            .map(|s| s.id)
            .collect()
    }

    /// First window of `kind`, skipping `except`.
    pub fn find_kind(&self, kind: WindowKind, except: SessionId) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.id != except && s.window.kind() == kind)
            .map(|s| s.id)
    }

    /// Every session with a bound repository, in id order.
    pub fn bound_sessions(&self) -> Vec<(SessionId, BoundResource)> {
        self.sessions
            .values()
            .filter_map(|s| s.resource.clone().map(|r| (s.id, r)))
            .collect()
    }

    /// Remove a session. The caller tells the kernel and drops any watch.
    pub fn destroy_session(&mut self, session_id: SessionId) -> Option<WindowSession> {
        self.sessions.remove(&session_id)
    }

    pub fn windows(&self) -> impl Iterator<Item = (SessionId, &WindowHandle)> {
        self.sessions.values().map(|s| (s.id, &s.window))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(kind: WindowKind) -> (WindowHandle, mpsc::Receiver<WindowEvent>) {
        let (tx, rx) = mpsc::channel(8);
        (WindowHandle::new(kind, tx), rx)
    }

    #[test]
    fn sessions_get_distinct_ids() {
        let mut sessions = SessionRegistry::new();
        let (a, _ra) = window(WindowKind::Main);
        let (b, _rb) = window(WindowKind::Main);
        let id_a = sessions.create_session(a);
        let id_b = sessions.create_session(b);
        assert_ne!(id_a, id_b);
        assert!(sessions.lookup(id_a).is_some());
        assert_eq!(sessions.len(), 2);
    }

    #[test]
    fn bind_is_idempotent() {
        let mut sessions = SessionRegistry::new();
        let (w, _rx) = window(WindowKind::Main);
        let id = sessions.create_session(w);

        assert_eq!(sessions.bind_resource(id, "docs", "/repos/docs"), BindOutcome::Bound);
        assert_eq!(sessions.bind_resource(id, "docs", "/repos/docs"), BindOutcome::Unchanged);
        assert_eq!(sessions.bind_resource(42, "docs", "/repos/docs"), BindOutcome::NotFound);
        assert_eq!(sessions.bound_sessions().len(), 1);
    }

    #[test]
    fn lookup_by_resource_finds_the_owner() {
        let mut sessions = SessionRegistry::new();
        let (a, _ra) = window(WindowKind::Main);
        let (b, _rb) = window(WindowKind::Main);
        let id_a = sessions.create_session(a);
        let id_b = sessions.create_session(b);
        sessions.bind_resource(id_b, "notes", "/repos/notes");

        assert_eq!(sessions.lookup_by_resource("notes"), Some(id_b));
        assert_eq!(sessions.lookup_by_resource("docs"), None);
        assert_ne!(sessions.lookup_by_resource("notes"), Some(id_a));
    }

    #[test]
    fn destroy_tolerates_unbound_session() {
        let mut sessions = SessionRegistry::new();
        let (w, _rx) = window(WindowKind::RepoList);
        let id = sessions.create_session(w);

        let removed = sessions.destroy_session(id).unwrap();
        assert!(removed.resource.is_none());
        assert!(sessions.destroy_session(id).is_none());
        assert!(sessions.is_empty());
    }

    #[test]
    fn sessions_at_path_and_kind_lookup() {
        let mut sessions = SessionRegistry::new();
        let (list, _r1) = window(WindowKind::RepoList);
        let (main, _r2) = window(WindowKind::Main);
        let list_id = sessions.create_session(list);
        let main_id = sessions.create_session(main);
        sessions.bind_resource(main_id, "docs", "/repos/docs");

        assert_eq!(sessions.sessions_at_path(Path::new("/repos/docs")), vec![main_id]);
        assert_eq!(sessions.find_kind(WindowKind::RepoList, main_id), Some(list_id));
        assert_eq!(sessions.find_kind(WindowKind::RepoList, list_id), None);
    }

    #[test]
    fn delivery_reports_full_and_closed_windows() {
        let (tx, rx) = mpsc::channel(1);
        let w = WindowHandle::new(WindowKind::Main, tx);
        assert_eq!(w.deliver(WindowEvent::Focus), Delivery::Sent);
        assert_eq!(w.deliver(WindowEvent::Focus), Delivery::Full);
        drop(rx);
        assert_eq!(w.deliver(WindowEvent::Focus), Delivery::Closed);
    }
}
