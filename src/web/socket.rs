use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::hub::Outbound;
use crate::protocol::ClientMessage;
use crate::server::InboundEvent;
use crate::state::AppState;

/// Upgrade a request to the display/admin channel
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn to_ws_message(outbound: &Outbound) -> Option<Message> {
    match outbound {
        Outbound::Event(event) => match event.to_json() {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                error!("Failed to encode {} event: {}", event.kind(), e);
                None
            }
        },
        Outbound::Ping => Some(Message::Ping(Default::default())),
        Outbound::Close => Some(Message::Close(None)),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let conn = Uuid::new_v4();

    if state
        .inbound
        .send(InboundEvent::Connected { conn, sender: tx })
        .await
        .is_err()
    {
        warn!("Dispatcher is gone, refusing connection {}", conn);
        return;
    }

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let closing = matches!(outbound, Outbound::Close);
            if let Some(message) = to_ws_message(&outbound) {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let event = match msg {
            Ok(Message::Text(text)) => match ClientMessage::parse(text.as_str()) {
                Ok(message) => InboundEvent::Message { conn, message },
                Err(e) => {
                    debug!("Dropping malformed message from {}: {}", conn, e);
                    continue;
                }
            },
            Ok(Message::Pong(_)) => InboundEvent::Pong { conn },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!("WebSocket error on {}: {}", conn, e);
                break;
            }
            _ => continue,
        };
        if state.inbound.send(event).await.is_err() {
            break;
        }
    }

    writer.abort();
    let _ = state.inbound.send(InboundEvent::Disconnected { conn }).await;
}
