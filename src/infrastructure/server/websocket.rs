//! WebSocket Handler
//!
//! Real-time streaming of identity events to connected clients. Each client
//! gets its own event-bus subscription; every domain event is forwarded as
//! one JSON message.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::infrastructure::server::AppState;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    Connected { client_id: String },
    Pong,
}

/// GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = Uuid::new_v4().to_string();
    debug!("WebSocket client {} connected", client_id);

    let (mut sender, mut receiver) = socket.split();
    let mut events = state.event_bus.subscribe();

    let hello = ControlMessage::Connected {
        client_id: client_id.clone(),
    };
    if let Ok(text) = serde_json::to_string(&hello) {
        if sender.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(event.as_ref()) else { continue };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) if text == "ping" => {
                        let Ok(pong) = serde_json::to_string(&ControlMessage::Pong) else {
                            continue;
                        };
                        if sender.send(Message::Text(pong)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!("WebSocket client {} disconnected", client_id);
}
