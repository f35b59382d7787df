use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures::{stream::StreamExt, SinkExt};
use hush_common::ServerMessage;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::TransportLimits;
use crate::hub::{HubEvent, Outbox, RelayHandle};
use crate::security::MessageWindow;
use crate::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    // Oversized frames below this cap get an error reply; above it the socket is dropped.
    let hard_cap = state.limits.max_message_bytes.saturating_mul(2);
    ws.max_message_size(hard_cap)
        .max_frame_size(hard_cap)
        .on_upgrade(move |socket| handle_socket(socket, state.hub, state.limits, addr))
}

async fn handle_socket(
    stream: WebSocket,
    hub: RelayHandle,
    limits: TransportLimits,
    addr: SocketAddr,
) {
    let conn = hub.next_connection_id();
    info!(%conn, "client connecting from {}", addr);

    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<String>(limits.outbox_capacity.max(1));
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
        let _ = disconnect_tx.try_send(());
    });

    if !hub
        .send(HubEvent::Connected {
            conn,
            outbox: tx.clone(),
        })
        .await
    {
        warn!(%conn, "relay hub unavailable, dropping connection");
        return;
    }

    let mut window = MessageWindow::per_minute(limits.messages_per_minute);

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!(%conn, "websocket error: {}", err);
                        break;
                    }
                };

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        send_error(&tx, "binary messages are not supported");
                        continue;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                if !window.allow() {
                    send_error(&tx, "Rate limit exceeded");
                    continue;
                }

                if text.len() > limits.max_message_bytes {
                    send_error(&tx, "Message too large");
                    continue;
                }

                if !hub.send(HubEvent::Message { conn, text }).await {
                    break;
                }
            }
        }
    }

    let _ = hub.send(HubEvent::Closed { conn }).await;
    info!(%conn, "client disconnected from {}", addr);
}

fn send_error(tx: &Outbox, message: &str) {
    match ServerMessage::error(message).to_json() {
        Ok(json) => {
            if tx.try_send(json).is_err() {
                debug!("outbox full, dropping transport error reply");
            }
        }
        Err(err) => warn!("failed to encode error reply: {}", err),
    }
}
