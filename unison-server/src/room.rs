//! One room: participants, leadership, the authoritative CRDT document
//! and the monotonic version fence.
//!
//! Every state change and its fan-out happen under the room lock, so two
//! updates to the same room serialize and all participants observe
//! `property_updated` frames in the same, strictly increasing version
//! order.

use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use unison_core::engine::CrdtEngine;
use unison_core::error::EngineError;
use unison_core::op::OpKind;
use unison_core::protocol::{ClientId, Host, PropertyUpdate, RoomData, RoomId, ServerFrame, StateSnapshot};
use unison_core::transport::Outbound;

/// Who owns the room's lifecycle: client-owned rooms die with their last
/// participant, server-owned rooms persist until destroyed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomOwner {
    Client,
    Server,
}

/// Point-in-time room descriptor for host-application introspection.
#[derive(Debug, Clone)]
pub struct RoomSummary {
    pub id: RoomId,
    pub participant_count: usize,
    pub host: Host,
    pub version: u64,
}

/// What `depart` left behind.
#[derive(Debug, PartialEq, Eq)]
pub enum Departure {
    /// Other participants remain.
    Remaining(usize),
    /// Room emptied but persists (server-owned).
    Empty,
    /// Room emptied and is client-owned; the caller must destroy it.
    DestroyRoom,
}

/// Resolves a participant id to its transport sender; participants whose
/// transport is gone are skipped.
pub type Resolver<'a> = &'a dyn Fn(&str) -> Option<mpsc::UnboundedSender<Outbound>>;

pub struct Room {
    pub id: RoomId,
    inner: Mutex<RoomInner>,
}

struct RoomInner {
    participants: Vec<ClientId>,
    host: Host,
    max_size: usize,
    engine: CrdtEngine,
    version: u64,
    owner: RoomOwner,
}

impl Room {
    pub fn new(id: RoomId, host: Host, owner: RoomOwner, max_size: usize) -> Self {
        Self {
            id,
            inner: Mutex::new(RoomInner {
                participants: Vec::new(),
                host,
                max_size,
                engine: CrdtEngine::new(),
                version: 0,
                owner,
            }),
        }
    }

    /// Seed initial storage as a sequence of `set` operations. Invalid
    /// values are skipped rather than failing room creation.
    pub fn seed(&self, initial_storage: Map<String, Value>) {
        let mut inner = self.inner.lock();
        for (key, value) in initial_storage {
            if let Err(err) = inner.engine.update_property(&key, OpKind::Set, value, None) {
                warn!("[room:{}] dropping initial key {key}: {err}", self.id);
            }
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.lock().engine.state()
    }

    pub fn properties(&self) -> Map<String, Value> {
        self.inner.lock().engine.properties().clone()
    }

    pub fn room_data(&self) -> RoomData {
        let inner = self.inner.lock();
        RoomData {
            state: inner.engine.state(),
            participant_count: inner.participants.len(),
            host: inner.host.clone(),
            version: inner.version,
        }
    }

    pub fn summary(&self) -> RoomSummary {
        let inner = self.inner.lock();
        RoomSummary {
            id: self.id.clone(),
            participant_count: inner.participants.len(),
            host: inner.host.clone(),
            version: inner.version,
        }
    }

    pub fn host(&self) -> Host {
        self.inner.lock().host.clone()
    }

    pub fn owner(&self) -> RoomOwner {
        self.inner.lock().owner
    }

    pub fn max_size(&self) -> usize {
        self.inner.lock().max_size
    }

    pub fn participants(&self) -> Vec<ClientId> {
        self.inner.lock().participants.clone()
    }

    /// Visit every participant id, in join order.
    pub fn for_each_participant(&self, mut f: impl FnMut(&str)) {
        let inner = self.inner.lock();
        for participant in &inner.participants {
            f(participant);
        }
    }

    pub fn participant_count(&self) -> usize {
        self.inner.lock().participants.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().participants.iter().any(|p| p == id)
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.participants.len() >= inner.max_size
    }

    /// Add the creator as first participant.
    pub fn add_creator(&self, id: &str) {
        let mut inner = self.inner.lock();
        inner.participants.push(id.to_string());
    }

    /// Admit a participant. The size check, the join payload, the
    /// absent-host promotion and all notification sends share one
    /// critical section so no update broadcast can interleave between
    /// the join snapshot and its delivery.
    pub fn try_join(
        &self,
        id: &str,
        host_is_gone: &dyn Fn(&str) -> bool,
        resolve: Resolver<'_>,
    ) -> Option<RoomData> {
        let mut inner = self.inner.lock();
        if inner.participants.len() >= inner.max_size {
            return None;
        }
        inner.participants.push(id.to_string());

        let promoted = match &inner.host {
            Host::Client(host_id) => host_id != id && host_is_gone(host_id),
            Host::Server => false,
        };
        if promoted {
            inner.host = Host::Client(id.to_string());
        }

        let data = RoomData {
            state: inner.engine.state(),
            participant_count: inner.participants.len(),
            host: inner.host.clone(),
            version: inner.version,
        };

        if let Some(tx) = resolve(id) {
            let accepted = ServerFrame::JoinAccepted {
                state: data.state.clone(),
                participant_count: data.participant_count,
                host: data.host.clone(),
                version: data.version,
            };
            let _ = tx.send(Outbound::Frame(accepted.encode()));
        }
        if promoted {
            debug!("[room:{}] absent host replaced by joiner {id}", self.id);
            Self::fan_out(
                &inner.participants,
                &ServerFrame::HostMigrated {
                    new_host: Host::Client(id.to_string()),
                },
                Some(id),
                resolve,
            );
        }
        Self::fan_out(
            &inner.participants,
            &ServerFrame::ClientConnected {
                client: id.to_string(),
                participant_count: data.participant_count,
            },
            Some(id),
            resolve,
        );
        Some(data)
    }

    /// Import a client operation, advance the version fence and fan out
    /// the broadcast, atomically.
    pub fn apply_and_broadcast(
        &self,
        update: PropertyUpdate,
        resolve: Resolver<'_>,
    ) -> Result<u64, EngineError> {
        let mut inner = self.inner.lock();
        inner.engine.import_property_update(update.clone())?;
        inner.version += 1;
        let version = inner.version;
        Self::fan_out(
            &inner.participants,
            &ServerFrame::PropertyUpdated { update, version },
            None,
            resolve,
        );
        Ok(version)
    }

    /// Server-authoritative write: applied locally, versioned, broadcast.
    pub fn update_local_and_broadcast(
        &self,
        key: &str,
        kind: OpKind,
        value: Value,
        update_value: Option<Value>,
        resolve: Resolver<'_>,
    ) -> Result<u64, EngineError> {
        let mut inner = self.inner.lock();
        let update = inner.engine.update_property(key, kind, value, update_value)?;
        inner.version += 1;
        let version = inner.version;
        Self::fan_out(
            &inner.participants,
            &ServerFrame::PropertyUpdated { update, version },
            None,
            resolve,
        );
        Ok(version)
    }

    /// Hand leadership to the first other participant. No-op unless
    /// `departing` currently hosts a room of more than one participant.
    pub fn migrate_host_from(&self, departing: &str, resolve: Resolver<'_>) -> Option<ClientId> {
        let mut inner = self.inner.lock();
        if !inner.host.is_client(departing) || inner.participants.len() <= 1 {
            return None;
        }
        let new_host = inner
            .participants
            .iter()
            .find(|p| p.as_str() != departing)?
            .clone();
        inner.host = Host::Client(new_host.clone());
        debug!("[room:{}] host migrated {departing} -> {new_host}", self.id);
        Self::fan_out(
            &inner.participants,
            &ServerFrame::HostMigrated {
                new_host: Host::Client(new_host.clone()),
            },
            Some(departing),
            resolve,
        );
        Some(new_host)
    }

    /// Final removal of a participant once its session is gone for good.
    pub fn depart(&self, id: &str, resolve: Resolver<'_>) -> Departure {
        let mut inner = self.inner.lock();
        inner.participants.retain(|p| p != id);
        if inner.participants.is_empty() {
            return if inner.owner == RoomOwner::Client {
                Departure::DestroyRoom
            } else {
                inner.host = Host::Server;
                Departure::Empty
            };
        }
        // Migration normally ran when the transport closed; direct kicks
        // land here with the host still set.
        if inner.host.is_client(id) {
            let new_host = inner.participants[0].clone();
            inner.host = Host::Client(new_host.clone());
            Self::fan_out(
                &inner.participants,
                &ServerFrame::HostMigrated {
                    new_host: Host::Client(new_host),
                },
                None,
                resolve,
            );
        }
        let count = inner.participants.len();
        Self::fan_out(
            &inner.participants,
            &ServerFrame::ClientDisconnected {
                client: id.to_string(),
                participant_count: count,
            },
            None,
            resolve,
        );
        Departure::Remaining(count)
    }

    /// Broadcast an arbitrary frame to current participants.
    pub fn broadcast(&self, frame: &ServerFrame, except: Option<&str>, resolve: Resolver<'_>) {
        let inner = self.inner.lock();
        Self::fan_out(&inner.participants, frame, except, resolve);
    }

    fn fan_out(
        participants: &[ClientId],
        frame: &ServerFrame,
        except: Option<&str>,
        resolve: Resolver<'_>,
    ) {
        let bytes = frame.encode();
        for participant in participants {
            if except.is_some_and(|skip| skip == participant) {
                continue;
            }
            if let Some(tx) = resolve(participant) {
                let _ = tx.send(Outbound::Frame(bytes.clone()));
            }
        }
    }
}
