//! WebSocket endpoint

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use ks_core::ClientId;

use super::link::{ClientLink, Outbound};
use crate::state::GatewayState;

/// `GET /ws`
pub async fn ws_upgrade(State(state): State<Arc<GatewayState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one client socket until it closes.
///
/// The socket is split: a send task drains the link's outbound queue in
/// order while this task reads frames and feeds them to the link.
async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let client_id = ClientId::new(Uuid::new_v4().to_string());
    tracing::info!("Client {} connected", client_id);

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.config.output_buffer.max(1));

    let send_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let message = match item {
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        tracing::error!("Failed to serialize event: {}", e);
                        continue;
                    }
                },
                Outbound::Output(data) => Message::Binary(data.to_vec()),
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut link = ClientLink::new(client_id.clone(), state, tx);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => link.handle_text(&text).await,
            Ok(Message::Binary(data)) => link.handle_input(&data).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("Socket error for client {}: {}", client_id, e);
                break;
            }
        }
    }

    link.disconnect().await;
    drop(link);
    send_task.abort();
}
