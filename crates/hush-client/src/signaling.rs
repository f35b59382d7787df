use futures::{SinkExt, StreamExt};
use hush_common::{ClientMessage, Error, Result, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

const INBOUND_CAPACITY: usize = 256;

/// WebSocket connection to a room relay.
pub struct SignalingClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    member_id: String,
}

impl SignalingClient {
    /// Connect and wait for the relay's `welcome`.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = connect_async(url).await.map_err(Error::transport)?;
        let mut client = Self {
            ws,
            member_id: String::new(),
        };

        match client.recv().await? {
            ServerMessage::Welcome { member_id } => client.member_id = member_id,
            other => {
                return Err(Error::transport(format!(
                    "expected welcome from relay, got {other:?}"
                )))
            }
        }
        Ok(client)
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        let text = msg.to_json()?;
        self.ws
            .send(Message::Text(text.into()))
            .await
            .map_err(Error::transport)
    }

    pub async fn recv(&mut self) -> Result<ServerMessage> {
        while let Some(msg) = self.ws.next().await {
            let msg = msg.map_err(Error::transport)?;
            if let Message::Text(text) = msg {
                return Ok(ServerMessage::parse(&text)?);
            }
        }
        Err(Error::transport("signaling connection closed"))
    }

    /// Split into background reader and writer tasks.
    pub fn spawn(self) -> SignalingHandle {
        let (mut sink, mut stream) = self.ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::channel::<ServerMessage>(INBOUND_CAPACITY);

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode relay message: {}", err);
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        debug!("signaling read error: {}", err);
                        break;
                    }
                };
                match ServerMessage::parse(&text) {
                    Ok(msg) => {
                        if inbound_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("ignoring relay frame: {}", err),
                }
            }
        });

        SignalingHandle {
            member_id: self.member_id,
            outbound: outbound_tx,
            inbound: inbound_rx,
        }
    }
}

/// Channels to a relay connection running in the background.
pub struct SignalingHandle {
    pub member_id: String,
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::Receiver<ServerMessage>,
}
