//! Connected-client bookkeeping: the live session table, session
//! tokens, pending-disconnect entries awaiting reconnection, the
//! client-to-room map and per-connection rate-limit buckets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use unison_core::id;
use unison_core::limits::{ID_MINT_ATTEMPTS, RATE_LIMIT_REFILL};
use unison_core::protocol::{ClientId, RoomId, ServerFrame};
use unison_core::transport::{ConnectionId, Outbound};

/// One registered client bound to a live transport.
pub struct Session {
    pub id: ClientId,
    pub connection_id: ConnectionId,
    pub session_token: String,
    pub custom_data: Option<Value>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Cleared when a ping goes out, set again by the pong.
    pub alive: AtomicBool,
    /// Set by a `disconnect` frame; skips the reconnection grace.
    pub willful: AtomicBool,
}

impl Session {
    pub fn new(
        id: ClientId,
        connection_id: ConnectionId,
        outbound: mpsc::UnboundedSender<Outbound>,
        session_token: String,
        custom_data: Option<Value>,
    ) -> Self {
        Self {
            id,
            connection_id,
            session_token,
            custom_data,
            outbound,
            alive: AtomicBool::new(true),
            willful: AtomicBool::new(false),
        }
    }

    pub fn send(&self, frame: &ServerFrame) {
        let _ = self.outbound.send(Outbound::Frame(frame.encode()));
    }

    pub fn send_raw(&self, bytes: Vec<u8>) {
        let _ = self.outbound.send(Outbound::Frame(bytes));
    }

    pub fn ping(&self) {
        let _ = self.outbound.send(Outbound::Ping);
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }

    pub fn outbound(&self) -> mpsc::UnboundedSender<Outbound> {
        self.outbound.clone()
    }
}

/// A session whose transport dropped, parked until the grace timer
/// fires or the client reclaims it.
pub struct PendingDisconnect {
    pub session: Arc<Session>,
    pub timer: JoinHandle<()>,
}

/// Result of reclaiming a pending session via `reconnect`.
pub enum Reclaim {
    Unknown,
    BadToken,
    Reclaimed(PendingDisconnect),
}

/// Outcome of charging a frame against a connection's bucket.
#[derive(Debug, PartialEq, Eq)]
pub enum Charge {
    Ok,
    /// First unpayable frame: terminate the transport.
    Terminate,
    /// Bucket already tripped; drop the frame quietly.
    AlreadyTripped,
}

struct RateBucket {
    tokens: u32,
    last_refill: Instant,
    tripped: bool,
}

impl RateBucket {
    fn new(capacity: u32) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
            tripped: false,
        }
    }

    fn charge(&mut self, cost: u32, capacity: u32) -> Charge {
        if self.tripped {
            return Charge::AlreadyTripped;
        }
        let now = Instant::now();
        if now.duration_since(self.last_refill) >= RATE_LIMIT_REFILL {
            self.tokens = capacity;
            self.last_refill = now;
        }
        if self.tokens >= cost {
            self.tokens -= cost;
            Charge::Ok
        } else {
            self.tripped = true;
            Charge::Terminate
        }
    }
}

#[derive(Default)]
struct Tables {
    clients: HashMap<ClientId, Arc<Session>>,
    by_connection: HashMap<ConnectionId, ClientId>,
    client_rooms: HashMap<ClientId, RoomId>,
    pending: HashMap<ClientId, PendingDisconnect>,
}

pub struct SessionManager {
    tables: Mutex<Tables>,
    buckets: Mutex<HashMap<ConnectionId, RateBucket>>,
    rate_capacity: u32,
}

impl SessionManager {
    pub fn new(rate_capacity: u32) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            buckets: Mutex::new(HashMap::new()),
            rate_capacity,
        }
    }

    /// An id is taken while a live session or a pending-disconnect entry
    /// holds it.
    pub fn is_id_taken(&self, id: &str) -> bool {
        let tables = self.tables.lock();
        tables.clients.contains_key(id) || tables.pending.contains_key(id)
    }

    /// Mint a client id not currently in use.
    pub fn mint_client_id(&self) -> Option<ClientId> {
        let tables = self.tables.lock();
        for _ in 0..ID_MINT_ATTEMPTS {
            let candidate = id::mint_id();
            if !tables.clients.contains_key(&candidate) && !tables.pending.contains_key(&candidate)
            {
                return Some(candidate);
            }
        }
        None
    }

    pub fn insert(&self, session: Arc<Session>) {
        let mut tables = self.tables.lock();
        tables
            .by_connection
            .insert(session.connection_id, session.id.clone());
        tables.clients.insert(session.id.clone(), session);
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.tables.lock().clients.get(id).cloned()
    }

    pub fn client_of_connection(&self, connection_id: ConnectionId) -> Option<ClientId> {
        self.tables.lock().by_connection.get(&connection_id).cloned()
    }

    /// True while `id` is registered on exactly this transport; admission
    /// paths re-check it after a hook suspends.
    pub fn is_live_on(&self, id: &str, connection_id: ConnectionId) -> bool {
        self.tables
            .lock()
            .clients
            .get(id)
            .is_some_and(|s| s.connection_id == connection_id)
    }

    /// Remove the live session bound to this transport, if the binding
    /// is still current.
    pub fn take_live_by_connection(&self, connection_id: ConnectionId) -> Option<Arc<Session>> {
        let mut tables = self.tables.lock();
        let id = tables.by_connection.remove(&connection_id)?;
        match tables.clients.get(&id) {
            Some(session) if session.connection_id == connection_id => tables.clients.remove(&id),
            _ => None,
        }
    }

    pub fn outbound_of(&self, id: &str) -> Option<mpsc::UnboundedSender<Outbound>> {
        self.tables.lock().clients.get(id).map(|s| s.outbound())
    }

    pub fn mark_alive(&self, connection_id: ConnectionId) {
        let tables = self.tables.lock();
        if let Some(id) = tables.by_connection.get(&connection_id)
            && let Some(session) = tables.clients.get(id)
        {
            session.alive.store(true, Ordering::SeqCst);
        }
    }

    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.tables.lock().clients.values().cloned().collect()
    }

    pub fn drain_live(&self) -> Vec<Arc<Session>> {
        let mut tables = self.tables.lock();
        tables.by_connection.clear();
        tables.clients.drain().map(|(_, s)| s).collect()
    }

    pub fn room_of(&self, id: &str) -> Option<RoomId> {
        self.tables.lock().client_rooms.get(id).cloned()
    }

    pub fn set_room(&self, id: &str, room_id: RoomId) {
        self.tables.lock().client_rooms.insert(id.to_string(), room_id);
    }

    pub fn clear_room(&self, id: &str) -> Option<RoomId> {
        self.tables.lock().client_rooms.remove(id)
    }

    pub fn insert_pending(&self, entry: PendingDisconnect) {
        let id = entry.session.id.clone();
        debug!("[client:{id}] entering pending-disconnect");
        self.tables.lock().pending.insert(id, entry);
    }

    /// Remove and return the pending entry regardless of token; used by
    /// the grace-timer expiry.
    pub fn take_pending(&self, id: &str) -> Option<PendingDisconnect> {
        self.tables.lock().pending.remove(id)
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.tables.lock().pending.contains_key(id)
    }

    /// Single critical section for the reconnect path: the pending
    /// entry only leaves the table when the supplied token matches.
    pub fn try_reclaim(&self, id: &str, supplied_token: &str) -> Reclaim {
        let mut tables = self.tables.lock();
        let Some(entry) = tables.pending.get(id) else {
            return Reclaim::Unknown;
        };
        if !id::token_matches(&entry.session.session_token, supplied_token) {
            return Reclaim::BadToken;
        }
        Reclaim::Reclaimed(tables.pending.remove(id).expect("entry present"))
    }

    pub fn abort_all_pending(&self) {
        let mut tables = self.tables.lock();
        for (_, entry) in tables.pending.drain() {
            entry.timer.abort();
        }
    }

    /// Rate-limit check and decrement in one critical section.
    pub fn charge(&self, connection_id: ConnectionId, cost: u32) -> Charge {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(connection_id)
            .or_insert_with(|| RateBucket::new(self.rate_capacity));
        bucket.charge(cost, self.rate_capacity)
    }

    pub fn drop_bucket(&self, connection_id: ConnectionId) {
        self.buckets.lock().remove(&connection_id);
    }
}
