//! Binary MessagePack wire protocol.
//!
//! Every frame is one MessagePack map with a `type` key. The codec is
//! deliberately thin: transports move opaque byte frames, and both ends
//! call [`ClientFrame::decode`] / [`ServerFrame::decode`] at the edge.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::clock::VectorClock;
use crate::id::SERVER_ID;
use crate::op::Operation;

pub type ClientId = String;
pub type RoomId = String;

/// Room leadership: a participant, or the server itself for
/// server-owned rooms. Serializes as the id string with the reserved
/// `"server"` sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Server,
    Client(ClientId),
}

impl Host {
    pub fn as_str(&self) -> &str {
        match self {
            Host::Server => SERVER_ID,
            Host::Client(id) => id,
        }
    }

    pub fn is_client(&self, id: &str) -> bool {
        matches!(self, Host::Client(host) if host == id)
    }
}

impl Serialize for Host {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Host {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(if raw == SERVER_ID {
            Host::Server
        } else {
            Host::Client(raw)
        })
    }
}

/// Export record for one local mutation: what peers import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyUpdate {
    pub key: String,
    pub operation: Operation,
    /// The author's full clock at export time; receivers merge it.
    pub vector_clock: VectorClock,
}

/// Full-document snapshot: ordered pair-sequences so the maps survive
/// any codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub key_operations: Vec<(String, Vec<Operation>)>,
    pub vector_clock: VectorClock,
}

/// Room payload returned on join and successful reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomData {
    pub state: StateSnapshot,
    pub participant_count: usize,
    pub host: Host,
    pub version: u64,
}

/// Opaque application request relayed to the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Frames a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<ClientId>,
        #[serde(
            rename = "customData",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        custom_data: Option<Value>,
    },
    Reconnect {
        id: ClientId,
        #[serde(rename = "sessionToken")]
        session_token: String,
    },
    CreateRoom {
        #[serde(
            rename = "initialStorage",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        initial_storage: Option<Map<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<usize>,
    },
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    UpdateProperty {
        update: PropertyUpdate,
    },
    Request {
        request: AppRequest,
    },
    Disconnect,
}

/// Frames the server sends to clients, targeted or broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Registered {
        id: ClientId,
        #[serde(rename = "sessionToken")]
        session_token: String,
    },
    RegistrationFailed {
        reason: String,
    },
    Reconnected {
        #[serde(
            rename = "roomData",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        room_data: Option<RoomData>,
    },
    ReconnectionFailed {
        reason: String,
    },
    RoomCreated {
        state: StateSnapshot,
        #[serde(rename = "roomId")]
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<usize>,
    },
    RoomCreationFailed {
        reason: String,
    },
    JoinAccepted {
        state: StateSnapshot,
        #[serde(rename = "participantCount")]
        participant_count: usize,
        host: Host,
        version: u64,
    },
    JoinRejected {
        reason: String,
    },
    PropertyUpdated {
        update: PropertyUpdate,
        version: u64,
    },
    PropertyUpdateRejected {
        state: StateSnapshot,
    },
    ClientConnected {
        client: ClientId,
        #[serde(rename = "participantCount")]
        participant_count: usize,
    },
    ClientDisconnected {
        client: ClientId,
        #[serde(rename = "participantCount")]
        participant_count: usize,
    },
    HostMigrated {
        #[serde(rename = "newHost")]
        new_host: Host,
    },
    Kicked {
        reason: String,
    },
    ServerStopped,
}

impl ClientFrame {
    pub fn encode(&self) -> Vec<u8> {
        rmp_serde::to_vec_named(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        rmp_serde::from_slice(bytes).ok()
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Vec<u8> {
        rmp_serde::to_vec_named(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        rmp_serde::from_slice(bytes).ok()
    }
}
