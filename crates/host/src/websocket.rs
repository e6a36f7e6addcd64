//! WebSocket handling
//!
//! One connection per window. The connection registers a session with the
//! dispatch loop, forwards the window's requests to it, and writes every
//! `WindowEvent` the loop pushes back. Dropping the connection destroys the
//! session.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use pocketrag_protocol::{SessionId, WindowEvent, WindowKind, WindowRequest};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::control_plane::HostCommand;
use crate::state::HttpState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const WINDOW_EVENT_BUFFER: usize = 256;

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    kind: WindowKind,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<HttpState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params.kind, state))
}

async fn health_handler(State(state): State<HttpState>) -> impl IntoResponse {
    Json((*state.snapshot()).clone())
}

/// Frames written by the send task besides window events.
enum Outbound {
    Pong(Bytes),
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, kind: WindowKind, state: HttpState) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

    let (events_tx, mut events_rx) = mpsc::channel::<WindowEvent>(WINDOW_EVENT_BUFFER);
    let (reply_tx, reply_rx) = oneshot::channel();
    let registered = state
        .commands
        .send(HostCommand::OpenWindow {
            kind,
            events: events_tx,
            reply: reply_tx,
        })
        .await;
    let session_id: SessionId = match (registered, reply_rx.await) {
        (Ok(()), Ok(id)) => id,
        _ => {
            warn!(
                component = "websocket",
                event = "ws.connection.rejected",
                connection_id = conn_id,
                "Dispatch loop unavailable, dropping connection"
            );
            return;
        }
    };
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        session_id,
        kind = ?kind,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(16);

    // Forward window events (and pongs) to the socket. Ends after a close event.
    let mut send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(event) = events_rx.recv() => {
                    let closing = matches!(event, WindowEvent::Close { .. });
                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            error!(
                                component = "websocket",
                                event = "ws.send.serialize_failed",
                                connection_id = conn_id,
                                error = %e,
                                "Failed to serialize window event"
                            );
                        }
                    }
                    if !closing {
                        continue;
                    }
                    Message::Close(Some(CloseFrame {
                        code: axum::extract::ws::close_code::NORMAL,
                        reason: "closed by host".into(),
                    }))
                }
                Some(Outbound::Pong(data)) = outbound_rx.recv() => Message::Pong(data),
                else => break,
            };
            let closing = matches!(frame, Message::Close(_));
            if ws_tx.send(frame).await.is_err() || closing {
                break;
            }
        }
        debug!(
            component = "websocket",
            event = "ws.send.finished",
            connection_id = conn_id,
            "Send task finished"
        );
    });

    let commands = state.commands.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_rx.next().await {
            let text = match result {
                Ok(Message::Text(text)) => text,
                Ok(Message::Ping(data)) => {
                    let _ = outbound_tx.send(Outbound::Pong(data)).await;
                    continue;
                }
                Ok(Message::Close(_)) => {
                    info!(
                        component = "websocket",
                        event = "ws.connection.close_frame",
                        connection_id = conn_id,
                        "Client sent close frame"
                    );
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(
                        component = "websocket",
                        event = "ws.connection.error",
                        connection_id = conn_id,
                        error = %e,
                        "WebSocket error"
                    );
                    break;
                }
            };

            let request: WindowRequest = match serde_json::from_str(&text) {
                Ok(r) => r,
                Err(e) => {
                    warn!(
                        component = "websocket",
                        event = "ws.message.parse_failed",
                        connection_id = conn_id,
                        error = %e,
                        payload_bytes = text.len(),
                        payload_preview = %truncate_for_log(&text, 240),
                        "Failed to parse window request"
                    );
                    continue;
                }
            };

            if commands
                .send(HostCommand::Window {
                    session_id,
                    request,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let _ = state
        .commands
        .send(HostCommand::CloseWindow { session_id })
        .await;
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        session_id,
        "WebSocket connection closed"
    );
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pocketrag_protocol::MessageKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite;

    use crate::control_plane::{ControlPlane, PlaneConfig};
    use crate::state::shared_snapshot;
    use crate::supervisor::DEFAULT_MAX_RESTARTS;
    use crate::test_support::FakeLauncher;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn serve() -> (std::net::SocketAddr, crate::test_support::FakeKernels, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut launcher = FakeLauncher::new();
        let kernels = launcher.kernels();
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let snapshot = shared_snapshot();
        let config = PlaneConfig {
            max_restarts: DEFAULT_MAX_RESTARTS,
            settings_path: dir.path().join("settings.json"),
            modified_settings_path: dir.path().join("settings-modified.json"),
        };
        let (plane, kernel_rx) = ControlPlane::new(
            Box::new(launcher),
            config,
            commands_tx.clone(),
            snapshot.clone(),
        );
        tokio::spawn(plane.run(kernel_rx, commands_rx));

        let app = router(HttpState::new(commands_tx, snapshot));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, kernels, dir)
    }

    async fn next_event<S>(ws: &mut S) -> WindowEvent
    where
        S: futures::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(TIMEOUT, ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("socket closed")
                .unwrap();
            if let tungstenite::Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn window_gets_hello_and_call_ids_over_the_socket() {
        let (addr, mut kernels, _dir) = serve().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?kind=main"))
            .await
            .unwrap();

        let window_id = match next_event(&mut ws).await {
            WindowEvent::Hello {
                window_id, kind, ..
            } => {
                assert_eq!(kind, WindowKind::Main);
                window_id
            }
            other => panic!("expected hello, got {other:?}"),
        };

        ws.send(tungstenite::Message::Text(r#"{"type":"get_repos"}"#.into()))
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut ws).await,
            WindowEvent::CallRegistered { .. }
        ));

        let mut kernel = kernels.next().await;
        kernel.announce_ready().await;
        let _ack = kernel.next_envelope().await;
        let queued = kernel.next_envelope().await;
        assert_eq!(queued.kind(), Some(MessageKind::GetRepos));
        assert_eq!(queued.message.i64_field("sessionId"), Some(window_id));
    }

    #[tokio::test]
    async fn malformed_requests_do_not_close_the_socket() {
        let (addr, _kernels, _dir) = serve().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut ws).await,
            WindowEvent::Hello {
                kind: WindowKind::RepoList,
                ..
            }
        ));

        ws.send(tungstenite::Message::Text("{not json".into()))
            .await
            .unwrap();
        ws.send(tungstenite::Message::Text(r#"{"type":"repo_list_check"}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut ws).await,
            WindowEvent::RepoListCheck { opened: false }
        );
    }

    #[tokio::test]
    async fn health_reports_the_snapshot() {
        let (addr, _kernels, _dir) = serve().await;
        let (_ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        let mut body = String::new();
        for _ in 0..50 {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            body.clear();
            stream.read_to_string(&mut body).await.unwrap();
            if body.contains("\"windows\":1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(body.starts_with("HTTP/1.1 200"), "{body}");
        assert!(body.contains("\"windows\":1"), "{body}");
        assert!(body.contains("\"state\":\"starting\""), "{body}");
    }
}
