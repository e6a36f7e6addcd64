//! Kernel envelope routing.
//!
//! `toMain` envelopes are control-plane traffic matched by message type;
//! everything else belongs to one window and is forwarded to it verbatim.

use pocketrag_protocol::{Envelope, Message, MessageKind, SessionId, WindowEvent};
use tracing::{debug, error, warn};

use super::{open_repo_outcome, push_event, ControlPlane, ExitCause, Flow};
use crate::supervisor::RestartCause;

/// Where a global reply's payload goes, besides resolving its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyTarget {
    /// Window named by `message.sessionId`.
    Session,
    /// Same, but only when the reply succeeded.
    SessionOnSuccess,
    /// Window named by `message.windowId`.
    Window,
    /// Nobody; a failure status is logged.
    None,
}

impl ControlPlane {
    pub(super) async fn route(&mut self, generation: u64, envelope: Envelope) -> Flow {
        if envelope.to_main {
            self.route_global(generation, envelope).await
        } else {
            self.route_session(envelope);
            Flow::Continue
        }
    }

    async fn route_global(&mut self, generation: u64, envelope: Envelope) -> Flow {
        let Some(kind) = envelope.kind() else {
            warn!(
                component = "router",
                event = "router.unknown_type",
                callback_id = envelope.callback_id,
                message_type = %envelope.message.kind,
                "Unknown control-plane message type"
            );
            return Flow::Continue;
        };

        let expects_reply = host_initiated(kind);
        if envelope.is_reply != expects_reply {
            warn!(
                component = "router",
                event = "router.direction_mismatch",
                callback_id = envelope.callback_id,
                message_type = %kind,
                is_reply = envelope.is_reply,
                "isReply does not match message type, dropping"
            );
            return Flow::Continue;
        }

        match kind {
            MessageKind::Ready => self.on_ready(generation, &envelope).await,
            MessageKind::KernelServerCrashed => {
                error!(
                    component = "router",
                    event = "router.kernel_server_crashed",
                    generation,
                    error = envelope.message.str_field("error").unwrap_or_default(),
                    "Kernel reported a fatal error"
                );
                if self.stopping.is_some() {
                    return Flow::Exit(ExitCause::Quit);
                }
                self.restart(RestartCause::KernelError).await
            }
            _ if expects_reply => self.on_global_reply(kind, envelope).await,
            _ => {
                warn!(
                    component = "router",
                    event = "router.unexpected_global",
                    callback_id = envelope.callback_id,
                    message_type = %kind,
                    "Session message type sent as control-plane traffic, dropping"
                );
                Flow::Continue
            }
        }
    }

    /// Acknowledge, reopen repositories lost in a restart, then flush queued writes.
    async fn on_ready(&mut self, generation: u64, announcement: &Envelope) -> Flow {
        let reopen = self
            .supervisor
            .mark_ready(generation, announcement, &self.sessions)
            .await;

        for (session_id, resource) in reopen {
            let Some(window) = self.sessions.lookup(session_id) else {
                continue;
            };
            let continuation = open_repo_outcome(session_id, window.sender());
            debug!(
                component = "router",
                event = "router.reopen",
                session_id,
                repo_name = %resource.name,
                "Reopening repository after restart"
            );
            let message = Message::new(MessageKind::OpenRepo)
                .with("repoName", resource.name)
                .with("sessionId", session_id);
            self.send_global(Some(session_id), message, Some(continuation))
                .await;
        }

        self.supervisor.flush_backlog().await;
        Flow::Continue
    }

    async fn on_global_reply(&mut self, kind: MessageKind, envelope: Envelope) -> Flow {
        let callback_id = envelope.callback_id;
        let target = reply_target(kind);

        if !envelope.is_success() && target != ReplyTarget::Session {
            let status = envelope.status.as_ref();
            warn!(
                component = "router",
                event = "router.reply.failed",
                callback_id,
                message_type = %kind,
                code = status.map(|s| s.code.as_str()).unwrap_or("<none>"),
                message = status.map(|s| s.message.as_str()).unwrap_or_default(),
                "Kernel reported a failed call"
            );
        }

        let window_id = match target {
            ReplyTarget::Session => envelope.message.i64_field("sessionId"),
            ReplyTarget::SessionOnSuccess if envelope.is_success() => {
                envelope.message.i64_field("sessionId")
            }
            ReplyTarget::Window => envelope.message.i64_field("windowId"),
            _ => None,
        };
        if let Some(window_id) = window_id {
            self.forward(window_id, &envelope);
        }

        self.calls.resolve(callback_id, &envelope);

        if kind == MessageKind::StopAll && self.stopping == Some(callback_id) {
            return Flow::Exit(ExitCause::Quit);
        }
        Flow::Continue
    }

    /// Forward to the owning window, then resolve its call if this is the first reply.
    fn route_session(&mut self, envelope: Envelope) {
        let session_id = envelope.session_id;
        if !self.forward(session_id, &envelope) {
            return;
        }
        if envelope.is_reply && self.calls.is_pending(envelope.callback_id) {
            self.calls.resolve(envelope.callback_id, &envelope);
        }
    }

    fn forward(&mut self, session_id: SessionId, envelope: &Envelope) -> bool {
        let Some(window) = self.sessions.lookup(session_id) else {
            warn!(
                component = "router",
                event = "router.session_not_found",
                session_id,
                callback_id = envelope.callback_id,
                message_type = %envelope.message.kind,
                "Window not found for envelope, dropping"
            );
            return false;
        };
        let event = WindowEvent::KernelData {
            envelope: envelope.clone(),
        };
        push_event(window, session_id, event, &mut self.stalled)
    }
}

/// Global types the host sends and the kernel answers. The rest arrive unsolicited.
fn host_initiated(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::StopAll
            | MessageKind::GetRepos
            | MessageKind::OpenRepo
            | MessageKind::CloseRepo
            | MessageKind::CreateRepo
            | MessageKind::DeleteRepo
            | MessageKind::CheckSettings
            | MessageKind::UpdateSettings
            | MessageKind::SetApiKey
            | MessageKind::GetApiKey
            | MessageKind::TestApi
            | MessageKind::GetAvailableHardware
    )
}

fn reply_target(kind: MessageKind) -> ReplyTarget {
    match kind {
        MessageKind::GetRepos => ReplyTarget::Session,
        MessageKind::CreateRepo | MessageKind::DeleteRepo => ReplyTarget::SessionOnSuccess,
        MessageKind::CheckSettings
        | MessageKind::GetApiKey
        | MessageKind::TestApi
        | MessageKind::GetAvailableHardware => ReplyTarget::Window,
        _ => ReplyTarget::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsolicited_types_are_not_replies() {
        assert!(!host_initiated(MessageKind::Ready));
        assert!(!host_initiated(MessageKind::KernelServerCrashed));
        assert!(!host_initiated(MessageKind::Search));
        assert!(host_initiated(MessageKind::OpenRepo));
    }

    #[test]
    fn settings_replies_route_by_window_id() {
        assert_eq!(reply_target(MessageKind::TestApi), ReplyTarget::Window);
        assert_eq!(reply_target(MessageKind::GetRepos), ReplyTarget::Session);
        assert_eq!(reply_target(MessageKind::DeleteRepo), ReplyTarget::SessionOnSuccess);
        assert_eq!(reply_target(MessageKind::SetApiKey), ReplyTarget::None);
    }
}
