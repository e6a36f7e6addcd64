//! Pending kernel calls, keyed by callback id.
//!
//! Every request the host writes to the kernel is registered here first so
//! its reply can be matched. A reply resolves its call exactly once; replies
//! for ids that are not pending (already resolved, discarded, or never sent)
//! are logged and ignored.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use pocketrag_protocol::{CallbackId, Envelope, SessionId};
use tracing::{debug, error, warn};

use crate::ids::IdSequence;

/// Runs with the reply envelope when the call resolves.
pub type Continuation = Box<dyn FnOnce(&Envelope) + Send + Sync>;

struct PendingCall {
    owner: Option<SessionId>,
    continuation: Option<Continuation>,
    registered_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved,
    Unknown,
}

#[derive(Default)]
pub struct CallRegistry {
    pending: HashMap<CallbackId, PendingCall>,
    ids: IdSequence,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process-level call.
    pub fn register(&mut self, continuation: Option<Continuation>) -> CallbackId {
        self.register_for(None, continuation)
    }

    /// Register a call made on behalf of a window, so it can be discarded when the window closes.
    pub fn register_for(
        &mut self,
        owner: Option<SessionId>,
        continuation: Option<Continuation>,
    ) -> CallbackId {
        let mut id = self.ids.next_id();
        while self.pending.contains_key(&id) {
            id = self.ids.next_id();
        }
        self.pending.insert(
            id,
            PendingCall {
                owner,
                continuation,
                registered_at: Instant::now(),
            },
        );
        id
    }

    /// Remove the call and run its continuation with `reply`.
    ///
    /// A panicking continuation is caught and logged.
    pub fn resolve(&mut self, callback_id: CallbackId, reply: &Envelope) -> Resolution {
        let Some(call) = self.pending.remove(&callback_id) else {
            warn!(
                component = "call_registry",
                event = "call.resolve.unknown",
                callback_id,
                message_type = %reply.message.kind,
                "Reply for a call that is not pending"
            );
            return Resolution::Unknown;
        };

        debug!(
            component = "call_registry",
            event = "call.resolved",
            callback_id,
            owner = ?call.owner,
            elapsed_ms = call.registered_at.elapsed().as_millis() as u64,
            "Call resolved"
        );

        if let Some(continuation) = call.continuation {
            if catch_unwind(AssertUnwindSafe(|| continuation(reply))).is_err() {
                error!(
                    component = "call_registry",
                    event = "call.continuation.panicked",
                    callback_id,
                    "Call continuation panicked"
                );
            }
        }
        Resolution::Resolved
    }

    /// Drop a call without running its continuation.
    pub fn discard(&mut self, callback_id: CallbackId) -> bool {
        self.pending.remove(&callback_id).is_some()
    }

    /// Drop every call owned by a window. Returns how many were dropped.
    pub fn discard_for_session(&mut self, session_id: SessionId) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, call| call.owner != Some(session_id));
        before - self.pending.len()
    }

    pub fn is_pending(&self, callback_id: CallbackId) -> bool {
        self.pending.contains_key(&callback_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use pocketrag_protocol::{Message, MessageKind, Status};

    fn reply(callback_id: CallbackId) -> Envelope {
        let mut env = Envelope::global_request(callback_id, Message::new(MessageKind::CloseRepo));
        env.is_reply = true;
        env.status = Some(Status::success());
        env
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Option<Continuation> {
        let counter = counter.clone();
        Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn ids_are_unique_among_pending_calls() {
        let mut calls = CallRegistry::new();
        let a = calls.register(None);
        let b = calls.register(None);
        assert_ne!(a, b);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn resolve_runs_continuation_once() {
        let mut calls = CallRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = calls.register(counting(&hits));

        assert_eq!(calls.resolve(id, &reply(id)), Resolution::Resolved);
        assert_eq!(calls.resolve(id, &reply(id)), Resolution::Unknown);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!calls.is_pending(id));
    }

    #[test]
    fn unknown_reply_is_a_noop() {
        let mut calls = CallRegistry::new();
        assert_eq!(calls.resolve(9999, &reply(9999)), Resolution::Unknown);
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn out_of_order_reply_resolves_only_its_own_call() {
        let mut calls = CallRegistry::new();
        let first_hits = Arc::new(AtomicUsize::new(0));
        let second_hits = Arc::new(AtomicUsize::new(0));
        let first = calls.register(counting(&first_hits));
        let second = calls.register(counting(&second_hits));

        calls.resolve(second, &reply(second));

        assert_eq!(second_hits.load(Ordering::SeqCst), 1);
        assert_eq!(first_hits.load(Ordering::SeqCst), 0);
        assert!(calls.is_pending(first));
        assert!(!calls.is_pending(second));
    }

    #[test]
    fn interleaved_register_and_resolve_never_double_resolves() {
        let mut calls = CallRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut issued = Vec::new();
        for round in 0..20 {
            issued.push(calls.register(counting(&hits)));
            if round % 3 == 0 {
                let id = issued[round / 2];
                calls.resolve(id, &reply(id));
            }
        }
        for id in &issued {
            calls.resolve(*id, &reply(*id));
            calls.resolve(*id, &reply(*id));
        }
        assert_eq!(hits.load(Ordering::SeqCst), issued.len());
        assert_eq!(calls.len(), 0);
    }

    #[test]
    fn discard_skips_continuation() {
        let mut calls = CallRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = calls.register(counting(&hits));

        assert!(calls.discard(id));
        assert_eq!(calls.resolve(id, &reply(id)), Resolution::Unknown);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn discard_for_session_only_drops_that_windows_calls() {
        let mut calls = CallRegistry::new();
        let a = calls.register_for(Some(1), None);
        let b = calls.register_for(Some(2), None);
        let global = calls.register(None);

        assert_eq!(calls.discard_for_session(1), 1);
        assert!(!calls.is_pending(a));
        assert!(calls.is_pending(b));
        assert!(calls.is_pending(global));
    }

    #[test]
    fn panicking_continuation_is_contained() {
        let mut calls = CallRegistry::new();
        let id = calls.register(Some(Box::new(|_| panic!("continuation failure"))));
        let other = calls.register(None);

        assert_eq!(calls.resolve(id, &reply(id)), Resolution::Resolved);
        assert_eq!(calls.resolve(other, &reply(other)), Resolution::Resolved);
    }
}
