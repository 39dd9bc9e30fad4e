//! Extensibility hooks.
//!
//! The host application implements [`Hooks`] and hands the server an
//! `Arc<dyn Hooks>`. Decision hooks gate admission and writes; the rest
//! are notification-only. Every default allows, so an application only
//! overrides what it cares about. Hook panics are caught by the
//! dispatcher and treated as the default decision.

use async_trait::async_trait;
use serde_json::{Map, Value};

use unison_core::protocol::{ClientId, PropertyUpdate, RoomId};

/// Allow/deny answer for registration and join gates. A denial may carry
/// a reason that is forwarded to the client verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    DenyWith(String),
}

impl Decision {
    pub fn reason(self, fallback: &str) -> Option<String> {
        match self {
            Decision::Allow => None,
            Decision::Deny => Some(fallback.to_string()),
            Decision::DenyWith(reason) => Some(reason),
        }
    }
}

/// Answer for `room_creation_requested`: proceed, refuse, or replace the
/// initial storage wholesale.
#[derive(Debug, Clone)]
pub enum CreationDecision {
    Proceed,
    Deny,
    Override(Map<String, Value>),
}

/// Context handed to `room_creation_requested`. `initial_storage` is a
/// deep copy; mutating it has no effect unless returned via `Override`.
#[derive(Debug, Clone)]
pub struct RoomCreationRequest {
    pub room_id: RoomId,
    pub client_id: ClientId,
    pub initial_storage: Map<String, Value>,
}

/// Context handed to `storage_update_requested`. `storage` is the room's
/// materialized document before the update.
#[derive(Debug, Clone)]
pub struct StorageUpdateRequest {
    pub room_id: RoomId,
    pub client_id: ClientId,
    pub update: PropertyUpdate,
    pub storage: Map<String, Value>,
}

/// An application-level `request` frame relayed verbatim.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub room_id: Option<RoomId>,
    pub client_id: ClientId,
    pub name: String,
    pub data: Option<Value>,
}

#[async_trait]
pub trait Hooks: Send + Sync {
    async fn client_registration_requested(
        &self,
        _id: &str,
        _custom_data: Option<&Value>,
    ) -> Decision {
        Decision::Allow
    }

    async fn client_join_requested(&self, _id: &str, _room_id: &str) -> Decision {
        Decision::Allow
    }

    async fn room_creation_requested(&self, _request: RoomCreationRequest) -> CreationDecision {
        CreationDecision::Proceed
    }

    /// Returning `false` rejects the write and re-syncs the author with
    /// the room's full state.
    async fn storage_update_requested(&self, _request: StorageUpdateRequest) -> bool {
        true
    }

    async fn request_received(&self, _request: RequestContext) {}

    async fn storage_updated(&self, _room_id: &str) {}

    async fn client_registered(&self, _id: &str) {}

    async fn client_joined_room(&self, _id: &str, _room_id: &str) {}

    async fn client_disconnected(&self, _id: &str) {}

    async fn room_created(&self, _room_id: &str) {}

    async fn room_destroyed(&self, _room_id: &str) {}
}

/// The do-nothing default used when the embedding application installs
/// no hooks.
pub struct NoHooks;

#[async_trait]
impl Hooks for NoHooks {}
