//! Kernel envelope: the unit exchanged with the kernel over stdio.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Window session identifier. `-1` addresses the process as a whole.
pub type SessionId = i64;

/// Correlation identifier shared by a request and its reply.
pub type CallbackId = i64;

/// `sessionId` carried by process-global traffic.
pub const GLOBAL_SESSION_ID: SessionId = -1;

/// Status code of a successful reply.
pub const STATUS_SUCCESS: &str = "SUCCESS";

/// One line of the kernel protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub session_id: SessionId,
    /// `true` for control-plane traffic, `false` for traffic owned by one window.
    pub to_main: bool,
    pub callback_id: CallbackId,
    pub is_reply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    pub message: Message,
    /// Fields the host does not interpret (the kernel's `data` payload among them).
    /// Kept so forwarded envelopes reach windows unchanged.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// A control-plane request (`sessionId = -1`, `toMain = true`).
    pub fn global_request(callback_id: CallbackId, message: Message) -> Self {
        Self {
            session_id: GLOBAL_SESSION_ID,
            to_main: true,
            callback_id,
            is_reply: false,
            status: None,
            message,
            extra: Map::new(),
        }
    }

    /// A request scoped to one window's open repository.
    pub fn session_request(session_id: SessionId, callback_id: CallbackId, message: Message) -> Self {
        Self {
            session_id,
            to_main: false,
            callback_id,
            is_reply: false,
            status: None,
            message,
            extra: Map::new(),
        }
    }

    /// The reply acknowledging this envelope with a SUCCESS status.
    pub fn acknowledge(&self) -> Self {
        let mut reply = self.clone();
        reply.is_reply = true;
        reply.status = Some(Status::success());
        reply
    }

    pub fn kind(&self) -> Option<MessageKind> {
        self.message.kind()
    }

    pub fn is_global(&self) -> bool {
        self.session_id == GLOBAL_SESSION_ID
    }

    /// True when the reply status is SUCCESS. Envelopes without a status are not successful.
    pub fn is_success(&self) -> bool {
        self.status.as_ref().is_some_and(Status::is_success)
    }

    pub fn data(&self) -> Option<&Value> {
        self.extra.get("data")
    }
}

/// Reply status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: STATUS_SUCCESS.to_string(),
            message: String::new(),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == STATUS_SUCCESS
    }
}

/// Tagged payload. `type` selects the operation; the other fields depend on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// The known kind, or `None` for types this host does not interpret.
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.kind)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn i64_field(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_i64)
    }
}

/// Message types the host sends or interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // Kernel lifecycle
    Ready,
    KernelServerCrashed,
    StopAll,

    // Repository management (global)
    GetRepos,
    OpenRepo,
    CloseRepo,
    CreateRepo,
    DeleteRepo,

    // Settings and models (global)
    CheckSettings,
    UpdateSettings,
    SetApiKey,
    GetApiKey,
    TestApi,
    GetAvailableHardware,

    // Session-scoped
    Search,
    BeginConversation,
    StopConversation,
    GetApiUsage,
    GetChunksInfo,
    SessionCrashed,
}

impl MessageKind {
    pub const ALL: [MessageKind; 20] = [
        MessageKind::Ready,
        MessageKind::KernelServerCrashed,
        MessageKind::StopAll,
        MessageKind::GetRepos,
        MessageKind::OpenRepo,
        MessageKind::CloseRepo,
        MessageKind::CreateRepo,
        MessageKind::DeleteRepo,
        MessageKind::CheckSettings,
        MessageKind::UpdateSettings,
        MessageKind::SetApiKey,
        MessageKind::GetApiKey,
        MessageKind::TestApi,
        MessageKind::GetAvailableHardware,
        MessageKind::Search,
        MessageKind::BeginConversation,
        MessageKind::StopConversation,
        MessageKind::GetApiUsage,
        MessageKind::GetChunksInfo,
        MessageKind::SessionCrashed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Ready => "ready",
            MessageKind::KernelServerCrashed => "kernelServerCrashed",
            MessageKind::StopAll => "stopAll",
            MessageKind::GetRepos => "getRepos",
            MessageKind::OpenRepo => "openRepo",
            MessageKind::CloseRepo => "closeRepo",
            MessageKind::CreateRepo => "createRepo",
            MessageKind::DeleteRepo => "deleteRepo",
            MessageKind::CheckSettings => "checkSettings",
            MessageKind::UpdateSettings => "updateSettings",
            MessageKind::SetApiKey => "setApiKey",
            MessageKind::GetApiKey => "getApiKey",
            MessageKind::TestApi => "testApi",
            MessageKind::GetAvailableHardware => "getAvailableHardware",
            MessageKind::Search => "search",
            MessageKind::BeginConversation => "beginConversation",
            MessageKind::StopConversation => "stopConversation",
            MessageKind::GetApiUsage => "getApiUsage",
            MessageKind::GetChunksInfo => "getChunksInfo",
            MessageKind::SessionCrashed => "sessionCrashed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn global_request_serializes_camel_case() {
        let env = Envelope::global_request(
            42,
            Message::new(MessageKind::OpenRepo)
                .with("repoName", "docs")
                .with("sessionId", 7),
        );
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "sessionId": -1,
                "toMain": true,
                "callbackId": 42,
                "isReply": false,
                "message": {"type": "openRepo", "repoName": "docs", "sessionId": 7}
            })
        );
    }

    #[test]
    fn unknown_fields_survive_decode() {
        let line = r#"{"sessionId":-1,"toMain":true,"callbackId":3,"isReply":true,
            "status":{"code":"SUCCESS","message":""},
            "message":{"type":"getRepos","sessionId":9},
            "data":{"repoList":[{"name":"a","path":"/a"}]}}"#;
        let env: Envelope = serde_json::from_str(line).unwrap();
        assert_eq!(env.kind(), Some(MessageKind::GetRepos));
        assert_eq!(env.message.i64_field("sessionId"), Some(9));
        assert!(env.is_success());
        assert_eq!(env.data().unwrap()["repoList"][0]["name"], "a");
    }

    #[test]
    fn acknowledge_keeps_correlation() {
        let ready: Envelope = serde_json::from_value(json!({
            "sessionId": -1, "toMain": true, "callbackId": 0, "isReply": false,
            "message": {"type": "ready"}
        }))
        .unwrap();
        let ack = ready.acknowledge();
        assert!(ack.is_reply);
        assert_eq!(ack.callback_id, ready.callback_id);
        assert_eq!(ack.session_id, ready.session_id);
        assert_eq!(ack.status, Some(Status::success()));
    }

    #[test]
    fn unknown_message_type_has_no_kind() {
        let msg = Message {
            kind: "embeddingStatus".into(),
            fields: Map::new(),
        };
        assert_eq!(msg.kind(), None);
    }

    #[test]
    fn every_kind_parses_back() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn missing_status_is_not_success() {
        let env = Envelope::session_request(5, 1, Message::new(MessageKind::Search));
        assert!(!env.is_success());
        assert!(!env.is_global());
    }
}
