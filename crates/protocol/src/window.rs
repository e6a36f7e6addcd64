//! Window ⇄ host messages, serialized as JSON over WebSocket.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{CallbackId, Envelope, SessionId};

/// What a window shows. Sent by the window as the `kind` query parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    #[default]
    RepoList,
    Main,
    Settings,
}

/// Messages sent from a window to the host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowRequest {
    /// Answered with `kernel_ready` once the kernel accepts traffic.
    WaitReady,

    // Repository management
    GetRepos,
    OpenRepo {
        repo_name: String,
        repo_path: String,
    },
    CreateRepo {
        path: String,
    },
    DeleteRepo {
        repo_name: String,
    },
    OpenRepoCheck {
        repo_name: String,
    },
    DeleteRepoCheck {
        repo_name: String,
    },
    RepoListCheck,
    RestartSession {
        repo_name: String,
    },
    WatchRepoDir {
        repo_path: String,
    },

    // Session-scoped work
    Search {
        query: String,
        accuracy: bool,
    },
    BeginConversation {
        model_name: String,
        conversation_id: i64,
        query: String,
    },
    StopConversation {
        conversation_id: i64,
    },
    GetApiUsage,
    GetChunksInfo,

    // Settings and models
    CheckSettings {
        settings: Value,
    },
    UpdateSettings {
        settings: Value,
    },
    /// Answered with `settings` carrying the stored file.
    GetSettings,
    /// Replace only the `performance` section of the stored settings.
    UpdateHardwareSettings {
        performance: Value,
    },
    SetApiKey {
        model_name: String,
        api_key: String,
    },
    GetApiKey {
        model_name: String,
    },
    TestApi {
        model_name: String,
        url: String,
        api: String,
    },
    GetAvailableHardware,

    /// The window answers a request the kernel sent it.
    Reply {
        envelope: Envelope,
    },
    /// The window's session died on the kernel side.
    SessionCrashed {
        error: String,
    },
}

impl WindowRequest {
    pub fn name(&self) -> &'static str {
        match self {
            WindowRequest::WaitReady => "wait_ready",
            WindowRequest::GetRepos => "get_repos",
            WindowRequest::OpenRepo { .. } => "open_repo",
            WindowRequest::CreateRepo { .. } => "create_repo",
            WindowRequest::DeleteRepo { .. } => "delete_repo",
            WindowRequest::OpenRepoCheck { .. } => "open_repo_check",
            WindowRequest::DeleteRepoCheck { .. } => "delete_repo_check",
            WindowRequest::RepoListCheck => "repo_list_check",
            WindowRequest::RestartSession { .. } => "restart_session",
            WindowRequest::WatchRepoDir { .. } => "watch_repo_dir",
            WindowRequest::Search { .. } => "search",
            WindowRequest::BeginConversation { .. } => "begin_conversation",
            WindowRequest::StopConversation { .. } => "stop_conversation",
            WindowRequest::GetApiUsage => "get_api_usage",
            WindowRequest::GetChunksInfo => "get_chunks_info",
            WindowRequest::CheckSettings { .. } => "check_settings",
            WindowRequest::UpdateSettings { .. } => "update_settings",
            WindowRequest::GetSettings => "get_settings",
            WindowRequest::UpdateHardwareSettings { .. } => "update_hardware_settings",
            WindowRequest::SetApiKey { .. } => "set_api_key",
            WindowRequest::GetApiKey { .. } => "get_api_key",
            WindowRequest::TestApi { .. } => "test_api",
            WindowRequest::GetAvailableHardware => "get_available_hardware",
            WindowRequest::Reply { .. } => "reply",
            WindowRequest::SessionCrashed { .. } => "session_crashed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogLevel {
    Info,
    Warning,
    Error,
}

/// Messages sent from the host to a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowEvent {
    Hello {
        window_id: SessionId,
        kind: WindowKind,
        kernel_ready: bool,
    },
    KernelReady,
    /// The correlation id issued for a request this window made.
    CallRegistered {
        callback_id: CallbackId,
        request: String,
    },
    /// An envelope from the kernel, forwarded unchanged.
    KernelData {
        envelope: Envelope,
    },
    RepoInitialized {
        repo_name: String,
        repo_path: String,
    },
    RepoFileChanged,
    RepoCheck {
        repo_name: String,
        opened: bool,
    },
    RepoListCheck {
        opened: bool,
    },
    Focus,
    /// Contents of `settings.json`.
    Settings {
        settings: Value,
    },
    Dialog {
        level: DialogLevel,
        title: String,
        message: String,
    },
    Close {
        reason: String,
    },
    Fatal {
        message: String,
    },
}
