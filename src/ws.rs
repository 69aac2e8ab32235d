//! WebSocket endpoint for the relay.
//!
//! Each accepted socket gets a server-assigned connection id and a bounded
//! outbound queue. The per-socket loop drains that queue, parses inbound
//! requests, and hands them to the hub; when the socket goes away for any
//! reason the connection is scrubbed from every group before the loop exits.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::hub::Hub;
use crate::protocol::{ClientRequest, ServerEvent};

/// Shared state behind the relay's routes.
pub struct RelayState {
    pub hub: Hub,
    pub config: RelayConfig,
}

/// Assemble the relay's routes. Middleware layers are added by the caller.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    timestamp: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one relay connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let connection_id = ulid::Ulid::new().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(state.config.connection_queue);
    state.hub.connect(&connection_id, event_tx).await;
    tracing::info!(connection = %connection_id, "relay connection established");

    loop {
        tokio::select! {
            // Drain events fanned out to this connection
            event = event_rx.recv() => {
                match event {
                    Some(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }

            // Handle inbound client requests
            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientRequest>(&text) {
                            Ok(request) => {
                                if let Some(reply) =
                                    handle_request(request, &connection_id, &state.hub).await
                                {
                                    if let Ok(json) = serde_json::to_string(&reply) {
                                        if sender.send(Message::Text(json.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::debug!(connection = %connection_id, "failed to parse client request: {}", e);
                                let error = ServerEvent::Error {
                                    code: "PARSE_ERROR".to_string(),
                                    msg: format!("Invalid request format: {}", e),
                                };
                                if let Ok(json) = serde_json::to_string(&error) {
                                    let _ = sender.send(Message::Text(json.into())).await;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection = %connection_id, "websocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.hub.disconnect(&connection_id).await;
    tracing::info!(connection = %connection_id, "relay connection closed");
}

/// Map one inbound request onto the hub. Returns an event to send back on
/// the same socket, or None when the request needs no reply.
async fn handle_request(
    request: ClientRequest,
    connection_id: &str,
    hub: &Hub,
) -> Option<ServerEvent> {
    match request {
        ClientRequest::JoinGroup { group_id } => {
            match hub.join(connection_id, &group_id).await {
                Ok(()) => None,
                Err(e) => Some(ServerEvent::Error {
                    code: "NOT_REGISTERED".to_string(),
                    msg: e.to_string(),
                }),
            }
        }
        ClientRequest::LeaveGroup { group_id } => {
            hub.leave(connection_id, &group_id).await;
            None
        }
        ClientRequest::SendMessage { group_id, message } => {
            hub.broadcast_message(&group_id, message).await;
            None
        }
        ClientRequest::UserTyping {
            group_id,
            author_identity,
        } => {
            hub.broadcast_typing(&group_id, &author_identity, true).await;
            None
        }
        ClientRequest::UserStoppedTyping {
            group_id,
            author_identity,
        } => {
            hub.broadcast_typing(&group_id, &author_identity, false)
                .await;
            None
        }
        ClientRequest::DeleteMessage {
            group_id,
            message_id,
        } => {
            hub.broadcast_deletion(&group_id, &message_id).await;
            None
        }
    }
}
