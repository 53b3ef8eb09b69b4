pub mod handlers;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::engine::GameEngine;
use crate::protocol::{ClientCommand, ServerEvent};
use crate::providers::{Identity, IdentityResolver};
use crate::types::RoomCode;

const ROOM_CHANNEL_CAPACITY: usize = 256;

/// Per-room broadcast channels. Channels are created lazily on first
/// subscription and dropped when the room is removed.
pub struct RoomHub {
    channels: RwLock<HashMap<RoomCode, broadcast::Sender<ServerEvent>>>,
}

impl RoomHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn subscribe(&self, code: &str) -> broadcast::Receiver<ServerEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(code.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send to every connection subscribed to the room. A room nobody
    /// listens to is fine; the event is dropped.
    pub async fn publish(&self, code: &str, event: ServerEvent) {
        if let Some(tx) = self.channels.read().await.get(code) {
            let _ = tx.send(event);
        }
    }

    pub async fn remove(&self, code: &str) {
        self.channels.write().await.remove(code);
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state behind the websocket route.
pub struct WsState {
    pub engine: Arc<GameEngine>,
    pub hub: Arc<RoomHub>,
    pub identity: Arc<dyn IdentityResolver>,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub credential: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<Arc<WsState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

/// Handle one WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, params: WsQuery, state: Arc<WsState>) {
    let (mut sender, mut receiver) = socket.split();

    // Identity is resolved once, at connection time
    let identity = match &params.credential {
        Some(credential) => match state.identity.resolve(credential).await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!("rejected connection: {e}");
                let error = ServerEvent::Error {
                    code: "UNAUTHORIZED".to_string(),
                    msg: e.to_string(),
                };
                if let Ok(json) = serde_json::to_string(&error) {
                    let _ = sender.send(Message::Text(json.into())).await;
                }
                return;
            }
        },
        None => Identity {
            user_id: format!("guest-{}", ulid::Ulid::new()),
            display_name: "Guest".to_string(),
        },
    };

    let conn_id = ulid::Ulid::new().to_string();
    tracing::info!(conn = %conn_id, user = %identity.user_id, "websocket connected");

    // Filled in once the connection enters a room
    let mut room_rx: Option<broadcast::Receiver<ServerEvent>> = None;

    loop {
        tokio::select! {
            // Room broadcasts, once subscribed
            room_event = async {
                match &mut room_rx {
                    Some(rx) => rx.recv().await.ok(),
                    None => std::future::pending::<Option<ServerEvent>>().await,
                }
            } => {
                if let Some(event) = room_event {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }

            // Client commands
            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(conn = %conn_id, "received: {}", text);

                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(command) => {
                                let dispatch = handlers::handle_command(
                                    command,
                                    &identity,
                                    &conn_id,
                                    &state.engine,
                                )
                                .await;

                                if let Some(code) = &dispatch.join {
                                    room_rx = Some(state.hub.subscribe(code).await);
                                }
                                for (code, event) in dispatch.broadcasts {
                                    state.hub.publish(&code, event).await;
                                }
                                if let Some(reply) = dispatch.reply {
                                    if let Ok(json) = serde_json::to_string(&reply) {
                                        if sender.send(Message::Text(json.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(conn = %conn_id, "failed to parse command: {e}");
                                let error = ServerEvent::Error {
                                    code: "PARSE_ERROR".to_string(),
                                    msg: format!("Invalid message format: {e}"),
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
                        tracing::warn!(conn = %conn_id, "websocket error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // The slot survives; the player can reconnect with the same identity
    if let Some(notice) = state.engine.handle_disconnect(&conn_id).await {
        state
            .hub
            .publish(
                &notice.room_code,
                ServerEvent::PlayerDisconnected {
                    player_key: notice.player_key,
                    display_name: notice.display_name,
                },
            )
            .await;
    }
    tracing::info!(conn = %conn_id, "websocket closed");
}
