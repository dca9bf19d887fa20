//! Real-time channel named in spec §6. The upstream system uses Socket.IO
//! rooms keyed per task; here a single WebSocket connection per
//! `(taskId, variantId)` carries the same tagged client->server and
//! server->client event vocabulary over one JSON-framed socket (a REDESIGN
//! note per SPEC_FULL.md §6, not a behavior change — same events, no room
//! abstraction needed because the path itself scopes the connection).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, State};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use shadow_core::{FinishReason, Part, TaskId, VariantId};
use tracing::{info, warn};

use crate::hub::HubMessage;
use crate::http::AppState;

/// Client → server events, tagged on `type` matching the real-time channel's
/// event names (`join-task`, `user-message`, `stop-stream`, ...).
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientEvent {
    JoinTask,
    GetChatHistory,
    UserMessage { message: String, #[serde(rename = "llmModel")] llm_model: String },
    StopStream,
    GetTerminalHistory,
    ClearTerminal,
}

/// Server → client events. `stream-chunk` carries one normalized `Part`;
/// everything else matches spec §6's names.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ServerEvent<'a> {
    ChatHistory { messages: &'a [shadow_core::ChatMessage] },
    StreamChunk { part: &'a Part },
    StreamComplete,
    StreamError { error: String },
    TodoUpdate { todos: serde_json::Value },
    TerminalHistory { entries: Vec<serde_json::Value> },
    TerminalCleared,
    Lag,
}

pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    AxumPath((task_id, variant_id)): AxumPath<(TaskId, VariantId)>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, task_id, variant_id))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, task_id: TaskId, variant_id: VariantId) {
    info!(%task_id, %variant_id, "websocket connected");

    loop {
        let Some(Ok(msg)) = socket.recv().await else {
            break;
        };
        let Message::Text(text) = msg else { continue };

        let Ok(event) = serde_json::from_str::<ClientEvent>(&text) else {
            warn!(%task_id, %variant_id, raw = %text, "unrecognized client event");
            continue;
        };

        match event {
            ClientEvent::JoinTask => {
                info!(%task_id, %variant_id, "client joined task room");
            }
            ClientEvent::GetChatHistory => {
                if let Err(err) = send_chat_history(&mut socket, &state, task_id, variant_id).await {
                    warn!(%task_id, error = %err, "failed to send chat history");
                }
            }
            ClientEvent::UserMessage { message, llm_model } => {
                match state
                    .orchestrator
                    .send_message(task_id, variant_id, message, llm_model)
                    .await
                {
                    Ok(_message_id) => {
                        if stream_run(&mut socket, &state, variant_id).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let payload = ServerEvent::StreamError { error: err.to_string() };
                        let _ = send_json(&mut socket, &payload).await;
                    }
                }
            }
            ClientEvent::StopStream => {
                if let Err(err) = state.orchestrator.stop_stream(variant_id) {
                    warn!(%task_id, %variant_id, error = %err, "stop-stream failed");
                }
            }
            ClientEvent::GetTerminalHistory => {
                let payload = ServerEvent::TerminalHistory { entries: vec![] };
                let _ = send_json(&mut socket, &payload).await;
            }
            ClientEvent::ClearTerminal => {
                let _ = send_json(&mut socket, &ServerEvent::TerminalCleared).await;
            }
        }
    }

    info!(%task_id, %variant_id, "websocket disconnected");
}

async fn send_chat_history(
    socket: &mut WebSocket,
    state: &Arc<AppState>,
    task_id: TaskId,
    variant_id: VariantId,
) -> Result<(), crate::error::StoreError> {
    let mut messages = state.store.list_messages(task_id).await?;
    messages.retain(|m| m.variant_id == variant_id);
    messages.sort_by_key(|m| m.sequence);
    let payload = ServerEvent::ChatHistory { messages: &messages };
    let _ = send_json(socket, &payload).await;
    Ok(())
}

/// Subscribes to the Session Hub for `variant_id` and forwards every part
/// to the socket as `stream-chunk`, closing with `stream-complete` on
/// `finish`/`error` or a hub `Lagged` notification. This is the replay
/// contract from spec §4.9: a client that called `user-message` right
/// before subscribing never misses the opening parts because `send_message`
/// has already started the run (and thus the buffer) by the time this
/// function calls `subscribe`.
async fn stream_run(socket: &mut WebSocket, state: &Arc<AppState>, variant_id: VariantId) -> Result<(), ()> {
    let Ok((backlog, mut rx)) = state.hub.subscribe(variant_id, None) else {
        return Ok(());
    };

    for (_, part) in &backlog {
        if send_json(socket, &ServerEvent::StreamChunk { part }).await.is_err() {
            return Err(());
        }
        if is_run_terminal(part) {
            let _ = send_json(socket, &ServerEvent::StreamComplete).await;
            return Ok(());
        }
    }

    loop {
        match rx.recv().await {
            Ok(HubMessage::Part { part, .. }) => {
                let is_terminal = is_run_terminal(&part);
                if send_json(socket, &ServerEvent::StreamChunk { part: &part }).await.is_err() {
                    return Err(());
                }
                if is_terminal {
                    let _ = send_json(socket, &ServerEvent::StreamComplete).await;
                    return Ok(());
                }
            }
            Ok(HubMessage::Lagged) => {
                let _ = send_json(socket, &ServerEvent::Lag).await;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                let _ = send_json(socket, &ServerEvent::Lag).await;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                let _ = send_json(socket, &ServerEvent::StreamComplete).await;
                return Ok(());
            }
        }
    }
}

/// A `Finish` part only closes the socket's stream when the run itself is
/// over. `FinishReason::ToolCalls` marks the end of one turn in a
/// multi-turn tool loop — the orchestrator re-invokes the provider right
/// after it, so the client must keep reading to see the next turn's text
/// and the run's actual terminal part.
fn is_run_terminal(part: &Part) -> bool {
    matches!(
        part,
        Part::Finish {
            reason: FinishReason::Stop
                | FinishReason::Length
                | FinishReason::Cancelled
                | FinishReason::Error,
            ..
        } | Part::Error { .. }
    )
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    socket.send(Message::Text(text.into())).await
}
