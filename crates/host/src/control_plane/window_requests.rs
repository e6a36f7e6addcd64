//! Requests arriving from windows.

use std::path::Path;

use pocketrag_protocol::{
    CallbackId, DialogLevel, Message, MessageKind, SessionId, WindowEvent, WindowKind,
    WindowRequest,
};
use tracing::{debug, info, warn};

use super::{open_repo_outcome, ControlPlane};
use crate::session_registry::BindOutcome;
use crate::settings;

impl ControlPlane {
    pub(super) async fn handle_window_request(
        &mut self,
        session_id: SessionId,
        request: WindowRequest,
    ) {
        let name = request.name();
        debug!(
            component = "window",
            event = "window.request",
            session_id,
            request = name,
            "Window request"
        );

        let issued = match request {
            WindowRequest::WaitReady => {
                self.wait_ready(session_id);
                None
            }

            WindowRequest::GetRepos => {
                let message = Message::new(MessageKind::GetRepos).with("sessionId", session_id);
                Some(self.send_global(Some(session_id), message, None).await)
            }
            WindowRequest::OpenRepo {
                repo_name,
                repo_path,
            } => self.open_repo(session_id, repo_name, repo_path).await,
            WindowRequest::CreateRepo { path } => {
                let repo_name = Path::new(&path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone());
                let message = Message::new(MessageKind::CreateRepo)
                    .with("repoName", repo_name)
                    .with("path", path)
                    .with("sessionId", session_id);
                Some(self.send_global(Some(session_id), message, None).await)
            }
            WindowRequest::DeleteRepo { repo_name } => {
                let message = Message::new(MessageKind::DeleteRepo)
                    .with("repoName", repo_name)
                    .with("sessionId", session_id);
                Some(self.send_global(Some(session_id), message, None).await)
            }
            WindowRequest::OpenRepoCheck { repo_name } => {
                let opened = match self.sessions.lookup_by_resource(&repo_name) {
                    Some(owner) => {
                        self.notify(owner, WindowEvent::Focus);
                        true
                    }
                    None => false,
                };
                self.notify(session_id, WindowEvent::RepoCheck { repo_name, opened });
                None
            }
            WindowRequest::DeleteRepoCheck { repo_name } => {
                let opened = self.sessions.lookup_by_resource(&repo_name).is_some();
                if opened {
                    self.notify(
                        session_id,
                        WindowEvent::Dialog {
                            level: DialogLevel::Warning,
                            title: "delete opened repo".to_string(),
                            message: format!(
                                "The repo \"{repo_name}\" is currently opened, please close it before deleting."
                            ),
                        },
                    );
                }
                self.notify(session_id, WindowEvent::RepoCheck { repo_name, opened });
                None
            }
            WindowRequest::RepoListCheck => {
                let opened = match self.sessions.find_kind(WindowKind::RepoList, session_id) {
                    Some(list) => {
                        self.notify(list, WindowEvent::Focus);
                        true
                    }
                    None => false,
                };
                self.notify(session_id, WindowEvent::RepoListCheck { opened });
                None
            }
            WindowRequest::RestartSession { repo_name } => {
                Some(self.send_open_repo(session_id, repo_name).await)
            }
            WindowRequest::WatchRepoDir { repo_path } => {
                if let Err(e) = self.watchers.watch(session_id, Path::new(&repo_path)) {
                    warn!(
                        component = "window",
                        event = "watcher.start_failed",
                        session_id,
                        path = %repo_path,
                        error = %e,
                        "Failed to watch repository directory"
                    );
                }
                None
            }

            WindowRequest::Search { query, accuracy } => {
                let message = Message::new(MessageKind::Search)
                    .with("query", query)
                    .with("accuracy", accuracy);
                Some(self.send_session(session_id, message).await)
            }
            WindowRequest::BeginConversation {
                model_name,
                conversation_id,
                query,
            } => {
                let message = Message::new(MessageKind::BeginConversation)
                    .with("modelName", model_name)
                    .with("conversationId", conversation_id)
                    .with("query", query);
                Some(self.send_session(session_id, message).await)
            }
            WindowRequest::StopConversation { conversation_id } => {
                let message = Message::new(MessageKind::StopConversation)
                    .with("conversationId", conversation_id);
                Some(self.send_session(session_id, message).await)
            }
            WindowRequest::GetApiUsage => {
                let message = Message::new(MessageKind::GetApiUsage);
                Some(self.send_session(session_id, message).await)
            }
            WindowRequest::GetChunksInfo => {
                let message = Message::new(MessageKind::GetChunksInfo);
                Some(self.send_session(session_id, message).await)
            }

            WindowRequest::CheckSettings { settings } => {
                let path = self.config.modified_settings_path.clone();
                if let Err(e) = settings::write_json(&path, &settings) {
                    warn!(
                        component = "window",
                        event = "settings.write_failed",
                        session_id,
                        error = %e,
                        "Failed to write candidate settings, not sending checkSettings"
                    );
                    return;
                }
                let message =
                    Message::new(MessageKind::CheckSettings).with("windowId", session_id);
                Some(self.send_global(Some(session_id), message, None).await)
            }
            WindowRequest::UpdateSettings { settings } => {
                let path = self.config.settings_path.clone();
                if let Err(e) = settings::write_json(&path, &settings) {
                    warn!(
                        component = "window",
                        event = "settings.write_failed",
                        session_id,
                        error = %e,
                        "Failed to write settings, not sending updateSettings"
                    );
                    return;
                }
                let message = Message::new(MessageKind::UpdateSettings);
                Some(self.send_global(Some(session_id), message, None).await)
            }
            WindowRequest::GetSettings => {
                match settings::read_json(&self.config.settings_path) {
                    Ok(settings) => {
                        self.notify(session_id, WindowEvent::Settings { settings });
                    }
                    Err(e) => {
                        warn!(
                            component = "window",
                            event = "settings.read_failed",
                            session_id,
                            error = %e,
                            "Failed to read settings"
                        );
                        self.notify(
                            session_id,
                            WindowEvent::Dialog {
                                level: DialogLevel::Error,
                                title: "getting settings failed".to_string(),
                                message: e.to_string(),
                            },
                        );
                    }
                }
                None
            }
            WindowRequest::UpdateHardwareSettings { performance } => {
                if let Err(e) = settings::update_performance(&self.config.settings_path, performance)
                {
                    warn!(
                        component = "window",
                        event = "settings.hardware_update_failed",
                        session_id,
                        error = %e,
                        "Failed to update hardware settings"
                    );
                }
                None
            }
            WindowRequest::SetApiKey {
                model_name,
                api_key,
            } => {
                let message = Message::new(MessageKind::SetApiKey)
                    .with("name", model_name)
                    .with("apiKey", api_key);
                Some(self.send_global(Some(session_id), message, None).await)
            }
            WindowRequest::GetApiKey { model_name } => {
                let message = Message::new(MessageKind::GetApiKey)
                    .with("name", model_name)
                    .with("windowId", session_id);
                Some(self.send_global(Some(session_id), message, None).await)
            }
            WindowRequest::TestApi {
                model_name,
                url,
                api,
            } => {
                let message = Message::new(MessageKind::TestApi)
                    .with("modelName", model_name)
                    .with("url", url)
                    .with("api", api)
                    .with("windowId", session_id);
                Some(self.send_global(Some(session_id), message, None).await)
            }
            WindowRequest::GetAvailableHardware => {
                let message = Message::new(MessageKind::GetAvailableHardware)
                    .with("windowId", session_id);
                Some(self.send_global(Some(session_id), message, None).await)
            }

            WindowRequest::Reply { envelope } => {
                if envelope.session_id != session_id {
                    warn!(
                        component = "window",
                        event = "window.reply.session_mismatch",
                        session_id,
                        envelope_session_id = envelope.session_id,
                        "Window replied for another session"
                    );
                }
                self.supervisor.write(envelope).await;
                None
            }
            WindowRequest::SessionCrashed { error } => {
                warn!(
                    component = "window",
                    event = "window.session_crashed",
                    session_id,
                    error = %error,
                    "Window reported its session crashed"
                );
                self.notify(
                    session_id,
                    WindowEvent::Dialog {
                        level: DialogLevel::Error,
                        title: "session crashed".to_string(),
                        message: error,
                    },
                );
                self.notify(
                    session_id,
                    WindowEvent::Close {
                        reason: "session crashed".to_string(),
                    },
                );
                None
            }
        };

        if let Some(callback_id) = issued {
            self.notify(
                session_id,
                WindowEvent::CallRegistered {
                    callback_id,
                    request: name.to_string(),
                },
            );
        }
    }

    fn wait_ready(&mut self, session_id: SessionId) {
        if self.supervisor.is_ready() {
            self.notify(session_id, WindowEvent::KernelReady);
            return;
        }
        let Some(window) = self.sessions.lookup(session_id) else {
            return;
        };
        let events = window.sender();
        let ready = self.supervisor.wait_ready();
        tokio::spawn(async move {
            if ready.await.is_ok() {
                let _ = events.send(WindowEvent::KernelReady).await;
            }
        });
    }

    /// Bind the repository to the window, then ask the kernel to open it.
    async fn open_repo(
        &mut self,
        session_id: SessionId,
        repo_name: String,
        repo_path: String,
    ) -> Option<CallbackId> {
        if let Some(owner) = self.sessions.lookup_by_resource(&repo_name) {
            if owner != session_id {
                info!(
                    component = "window",
                    event = "repo.open.already_open",
                    session_id,
                    owner,
                    repo_name = %repo_name,
                    "Repository already open in another window"
                );
                self.notify(owner, WindowEvent::Focus);
                self.notify(
                    session_id,
                    WindowEvent::RepoCheck {
                        repo_name,
                        opened: true,
                    },
                );
                return None;
            }
        }

        match self.sessions.bind_resource(session_id, &repo_name, &repo_path) {
            BindOutcome::NotFound => return None,
            BindOutcome::Unchanged => {
                debug!(
                    component = "window",
                    event = "repo.open.rebind",
                    session_id,
                    repo_name = %repo_name,
                    "Repository already bound to this window"
                );
            }
            BindOutcome::Bound => {}
        }

        self.notify(
            session_id,
            WindowEvent::RepoInitialized {
                repo_name: repo_name.clone(),
                repo_path,
            },
        );
        Some(self.send_open_repo(session_id, repo_name).await)
    }

    async fn send_open_repo(&mut self, session_id: SessionId, repo_name: String) -> CallbackId {
        let continuation = self
            .sessions
            .lookup(session_id)
            .map(|window| open_repo_outcome(session_id, window.sender()));
        let message = Message::new(MessageKind::OpenRepo)
            .with("repoName", repo_name)
            .with("sessionId", session_id);
        self.send_global(Some(session_id), message, continuation)
            .await
    }
}
