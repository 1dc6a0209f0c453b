//! Per-socket bridge between WebSocket frames and the orchestrator
//!
//! Each connection gets a server-assigned session key. Inbound text frames
//! are parsed as [`ClientFrame`]s and routed; outbound [`ServerFrame`]s
//! are serialized from the session's sink channel by a dedicated task.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use coderunner_core::protocol::ClientFrame;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::api::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_key = Uuid::new_v4().to_string();
    debug!(session_key = %session_key, "socket connected");

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    state
        .orchestrator
        .register_session(session_key.clone(), frame_tx);

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound: drain the orchestrator's sink into the socket
    let outbound = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("frame serialization failed: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Inbound: parse and route until the socket closes
    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Run {
                    language,
                    files,
                    submission_id,
                    ..
                }) => {
                    if let Err(e) =
                        state
                            .orchestrator
                            .submit_run(&session_key, &language, files, submission_id)
                    {
                        warn!(session_key = %session_key, "run dispatch failed: {}", e);
                    }
                }
                Ok(ClientFrame::Input { data }) => {
                    state.orchestrator.handle_input(&session_key, &data);
                }
                Ok(ClientFrame::Stop { .. }) => {
                    state.orchestrator.stop(&session_key);
                }
                Err(e) => {
                    debug!(session_key = %session_key, "unparseable frame: {}", e);
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.orchestrator.disconnect(&session_key).await;
    outbound.abort();
    debug!(session_key = %session_key, "socket closed");
}
