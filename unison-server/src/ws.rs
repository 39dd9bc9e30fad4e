//! WebSocket transport binding.
//!
//! Accepts TCP connections, performs the upgrade (checking the mount
//! path and the optional preflight callback), and bridges each socket to
//! the channel-based [`Connection`] the dispatcher consumes. Transport
//! pings ride WebSocket ping/pong frames.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Message,
    },
};
use uuid::Uuid;

use unison_core::transport::{Connection, Outbound, TransportEvent};

use crate::server::SyncServer;

/// Accept loop. Returns when the server stops.
pub async fn serve(server: Arc<SyncServer>, listener: TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on ws://{addr}{}", server.config().mount_path);
    }
    loop {
        tokio::select! {
            _ = server.shutdown_notify().notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if server.is_stopped() {
                        break;
                    }
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        if let Err(err) = handle_socket(server, stream, addr).await {
                            warn!("[ws] connection error from {addr}: {err}");
                        }
                    });
                }
                Err(err) => {
                    error!("[ws] accept failed: {err}");
                    break;
                }
            },
        }
    }
    info!("listener closed");
}

async fn handle_socket(
    server: Arc<SyncServer>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mount_path = server.config().mount_path.clone();
    let preflight = server.config().preflight.clone();

    let callback = move |req: &Request, resp: Response| {
        let path = req.uri().path();
        if path != mount_path {
            let mut refusal = ErrorResponse::new(Some("not found".into()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            return Err(refusal);
        }
        if let Some(preflight) = &preflight
            && !preflight(&addr, path)
        {
            let mut refusal = ErrorResponse::new(Some("forbidden".into()));
            *refusal.status_mut() = StatusCode::FORBIDDEN;
            return Err(refusal);
        }
        Ok(resp)
    };

    let ws_stream = accept_hdr_async(stream, callback).await?;
    debug!("[ws] upgraded connection from {addr}");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();
    server.accept(Connection {
        id: Uuid::new_v4(),
        outbound: outbound_tx,
        events: event_rx,
    });

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    loop {
        tokio::select! {
            instruction = outbound_rx.recv() => match instruction {
                Some(Outbound::Frame(bytes)) => {
                    if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Ping) => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(message)) => {
                    if message.is_binary() {
                        let _ = event_tx.send(TransportEvent::Frame(message.into_data().to_vec()));
                    } else if matches!(message, Message::Pong(_)) {
                        let _ = event_tx.send(TransportEvent::Pong);
                    } else if message.is_close() {
                        break;
                    }
                    // Text frames are ignored; pings are answered by the
                    // websocket layer itself.
                }
                Some(Err(err)) => {
                    warn!("[ws] receive error from {addr}: {err}");
                    break;
                }
                None => break,
            },
        }
    }
    let _ = event_tx.send(TransportEvent::Closed);
    Ok(())
}
