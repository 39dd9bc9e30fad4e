//! The transport seam.
//!
//! The protocol core never touches a socket type. A connection is a pair
//! of channels moving opaque binary frames plus transport-level control
//! (ping, pong, close). Concrete bindings (WebSocket, in-memory) bridge
//! these channels to the real medium.

use tokio::sync::mpsc;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// Inbound events as seen by the server's per-connection task.
#[derive(Debug)]
pub enum TransportEvent {
    /// One binary frame from the client.
    Frame(Vec<u8>),
    /// Transport-level pong; resets the liveness flag.
    Pong,
    /// The transport is gone. Always the final event.
    Closed,
}

/// Outbound instructions handed to the transport bridge.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Vec<u8>),
    Ping,
    Close,
}

/// Server half of one accepted transport connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Inbound events as seen by a client.
#[derive(Debug)]
pub enum SocketEvent {
    Frame(Vec<u8>),
    Closed,
}

/// Client half of a transport connection.
#[derive(Debug)]
pub struct ClientSocket {
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

pub mod memory {
    //! In-process transport used by the test suites: both halves wired
    //! through a bridge task, pings answered immediately.

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{ClientSocket, Connection, Outbound, SocketEvent, TransportEvent};

    /// Build a connected (client, server) transport pair.
    pub fn pair() -> (ClientSocket, Connection) {
        let (server_out_tx, mut server_out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (server_evt_tx, server_evt_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let (client_out_tx, mut client_out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (client_evt_tx, client_evt_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    instruction = server_out_rx.recv() => match instruction {
                        Some(Outbound::Frame(frame)) => {
                            if client_evt_tx.send(SocketEvent::Frame(frame)).is_err() {
                                let _ = server_evt_tx.send(TransportEvent::Closed);
                                break;
                            }
                        }
                        Some(Outbound::Ping) => {
                            // The in-memory medium is always live.
                            let _ = server_evt_tx.send(TransportEvent::Pong);
                        }
                        Some(Outbound::Close) | None => {
                            let _ = client_evt_tx.send(SocketEvent::Closed);
                            let _ = server_evt_tx.send(TransportEvent::Closed);
                            break;
                        }
                    },
                    frame = client_out_rx.recv() => match frame {
                        Some(frame) => {
                            let _ = server_evt_tx.send(TransportEvent::Frame(frame));
                        }
                        None => {
                            let _ = server_evt_tx.send(TransportEvent::Closed);
                            break;
                        }
                    },
                }
            }
        });

        (
            ClientSocket {
                outbound: client_out_tx,
                events: client_evt_rx,
            },
            Connection {
                id: Uuid::new_v4(),
                outbound: server_out_tx,
                events: server_evt_rx,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_moves_frames_both_ways() {
        let (mut client, mut server) = memory::pair();

        client.outbound.send(vec![1, 2, 3]).unwrap();
        match server.events.recv().await {
            Some(TransportEvent::Frame(frame)) => assert_eq!(frame, vec![1, 2, 3]),
            other => panic!("expected frame, got {other:?}"),
        }

        server.outbound.send(Outbound::Frame(vec![9])).unwrap();
        match client.events.recv().await {
            Some(SocketEvent::Frame(frame)) => assert_eq!(frame, vec![9]),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_memory_pair_answers_pings() {
        let (_client, mut server) = memory::pair();
        server.outbound.send(Outbound::Ping).unwrap();
        assert!(matches!(
            server.events.recv().await,
            Some(TransportEvent::Pong)
        ));
    }

    #[tokio::test]
    async fn test_close_reaches_both_halves() {
        let (mut client, mut server) = memory::pair();
        server.outbound.send(Outbound::Close).unwrap();
        assert!(matches!(client.events.recv().await, Some(SocketEvent::Closed)));
        assert!(matches!(
            server.events.recv().await,
            Some(TransportEvent::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_client_closes_server_side() {
        let (client, mut server) = memory::pair();
        drop(client);
        assert!(matches!(
            server.events.recv().await,
            Some(TransportEvent::Closed)
        ));
    }
}
