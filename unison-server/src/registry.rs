//! The table of live rooms.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use unison_core::id;
use unison_core::limits::ID_MINT_ATTEMPTS;
use unison_core::protocol::RoomId;

use crate::room::{Room, RoomSummary};

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a room id not currently in use.
    pub fn mint_room_id(&self) -> Option<RoomId> {
        let rooms = self.rooms.read();
        for _ in 0..ID_MINT_ATTEMPTS {
            let candidate = id::mint_id();
            if !rooms.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    pub fn insert(&self, room: Arc<Room>) {
        self.rooms.write().insert(room.id.clone(), room);
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().get(room_id).cloned()
    }

    pub fn remove(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.write().remove(room_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.read().is_empty()
    }

    pub fn summaries(&self) -> Vec<RoomSummary> {
        self.rooms.read().values().map(|room| room.summary()).collect()
    }

    pub fn clear(&self) {
        self.rooms.write().clear();
    }
}
