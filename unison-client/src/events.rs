//! Events delivered to the embedding application.

use unison_core::protocol::{ClientId, Host, RoomId};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Registered {
        id: ClientId,
    },
    RoomCreated {
        room_id: RoomId,
    },
    RoomJoined {
        room_id: RoomId,
    },
    /// The materialized storage changed (local or remote edit).
    StorageUpdated,
    ClientJoined {
        client: ClientId,
        participant_count: usize,
    },
    ClientLeft {
        client: ClientId,
        participant_count: usize,
    },
    HostChanged {
        new_host: Host,
        /// Whether this client is now the room leader.
        is_host: bool,
    },
    Error {
        message: String,
    },
    Kicked {
        reason: String,
    },
    /// Transport dropped; reconnection attempts are running.
    Disconnected,
    /// Session resumed and storage re-imported.
    Reconnected,
    /// Terminal: the instance tore itself down.
    InstanceDestroyed,
}
