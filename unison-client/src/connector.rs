//! Dialing. Every reconnection attempt goes through the [`Connector`]
//! so the in-memory transport used in tests and the WebSocket connector
//! are interchangeable.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::warn;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use unison_core::transport::{ClientSocket, SocketEvent};

use crate::error::ClientError;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial a fresh transport connection.
    async fn connect(&self) -> Result<ClientSocket, ClientError>;
}

/// WebSocket connector over `tokio-tungstenite`.
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(endpoint: &str) -> Result<Self, ClientError> {
        let url = Url::parse(endpoint).map_err(|err| ClientError::Connect(err.to_string()))?;
        Ok(Self { url })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<ClientSocket, ClientError> {
        let (ws_stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|err| ClientError::Connect(err.to_string()))?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            let (mut ws_tx, mut ws_rx) = ws_stream.split();
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(bytes) => {
                            if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    incoming = ws_rx.next() => match incoming {
                        Some(Ok(message)) => {
                            if message.is_binary() {
                                let _ = event_tx.send(SocketEvent::Frame(message.into_data().to_vec()));
                            } else if message.is_close() {
                                break;
                            }
                            // Ping/Pong answered by the websocket layer.
                        }
                        Some(Err(err)) => {
                            warn!("[ws] receive error: {err}");
                            break;
                        }
                        None => break,
                    },
                }
            }
            let _ = event_tx.send(SocketEvent::Closed);
        });

        Ok(ClientSocket {
            outbound: outbound_tx,
            events: event_rx,
        })
    }
}
