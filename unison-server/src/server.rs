//! The protocol dispatcher and the host-application interface.
//!
//! One task per transport connection consumes inbound events in FIFO
//! order, so a client's frames are handled one at a time; a frame that
//! suspends on a hook queues everything behind it. Cross-room work is
//! independent; per-room mutation and fan-out are serialized by the room
//! lock (see [`crate::room`]).

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use unison_core::id::{self, SERVER_ID};
use unison_core::limits::{CREATE_ROOM_COST, CLIENT_ROOM_MAX_SIZE, PING_INTERVAL, RECONNECT_GRACE, SERVER_ROOM_MAX_SIZE};
use unison_core::op::OpKind;
use unison_core::protocol::{ClientFrame, ClientId, Host, RoomId, ServerFrame, StateSnapshot};
use unison_core::transport::{Connection, ConnectionId, Outbound, TransportEvent};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hooks::{
    CreationDecision, Decision, Hooks, RequestContext, RoomCreationRequest, StorageUpdateRequest,
};
use crate::registry::RoomRegistry;
use crate::room::{Departure, Room, RoomOwner, RoomSummary};
use crate::session::{Charge, PendingDisconnect, Reclaim, Session, SessionManager};

/// Run a hook to completion, falling back to `default` if it panics.
async fn guarded<T>(name: &str, default: T, hook: impl Future<Output = T>) -> T {
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(value) => value,
        Err(_) => {
            error!("hook {name} panicked; proceeding with the default");
            default
        }
    }
}

fn reply(outbound: &mpsc::UnboundedSender<Outbound>, frame: &ServerFrame) {
    let _ = outbound.send(Outbound::Frame(frame.encode()));
}

pub struct SyncServer {
    config: ServerConfig,
    hooks: Arc<dyn Hooks>,
    sessions: SessionManager,
    registry: RoomRegistry,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
    stopped: AtomicBool,
}

impl SyncServer {
    pub fn new(config: ServerConfig, hooks: Arc<dyn Hooks>) -> Arc<Self> {
        let rate_capacity = config.rate_limit_capacity;
        let server = Arc::new(Self {
            config,
            hooks,
            sessions: SessionManager::new(rate_capacity),
            registry: RoomRegistry::new(),
            heartbeat: Mutex::new(None),
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
        });
        let handle = tokio::spawn(heartbeat_loop(Arc::downgrade(&server)));
        *server.heartbeat.lock() = Some(handle);
        server
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_notify(&self) -> &Notify {
        &self.shutdown
    }

    /// Attach an accepted transport connection; spawns its FIFO
    /// dispatch task.
    pub fn accept(self: &Arc<Self>, conn: Connection) {
        if self.is_stopped() {
            let _ = conn.outbound.send(Outbound::Close);
            return;
        }
        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.run_connection(conn).await;
        });
    }

    async fn run_connection(self: Arc<Self>, mut conn: Connection) {
        let conn_id = conn.id;
        debug!("[conn:{conn_id}] attached");
        while let Some(event) = conn.events.recv().await {
            match event {
                TransportEvent::Pong => self.sessions.mark_alive(conn_id),
                TransportEvent::Closed => break,
                TransportEvent::Frame(bytes) => {
                    if self.is_stopped() {
                        continue;
                    }
                    let Some(frame) = ClientFrame::decode(&bytes) else {
                        warn!("[conn:{conn_id}] undecodable frame ({} bytes)", bytes.len());
                        continue;
                    };
                    let cost = if matches!(frame, ClientFrame::CreateRoom { .. }) {
                        CREATE_ROOM_COST
                    } else {
                        1
                    };
                    match self.sessions.charge(conn_id, cost) {
                        Charge::Ok => {}
                        Charge::Terminate => {
                            warn!("[conn:{conn_id}] rate limit exhausted, terminating");
                            let _ = conn.outbound.send(Outbound::Close);
                            continue;
                        }
                        Charge::AlreadyTripped => continue,
                    }
                    self.handle_frame(conn_id, &conn.outbound, frame).await;
                }
            }
        }
        self.sessions.drop_bucket(conn_id);
        self.handle_transport_closed(conn_id).await;
        debug!("[conn:{conn_id}] detached");
    }

    async fn handle_frame(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        outbound: &mpsc::UnboundedSender<Outbound>,
        frame: ClientFrame,
    ) {
        match frame {
            ClientFrame::Register { id, custom_data } => {
                self.handle_register(conn_id, outbound, id, custom_data).await;
            }
            ClientFrame::Reconnect { id, session_token } => {
                self.handle_reconnect(conn_id, outbound, id, session_token).await;
            }
            ClientFrame::CreateRoom {
                initial_storage,
                size,
            } => {
                self.handle_create_room(conn_id, outbound, initial_storage, size).await;
            }
            ClientFrame::JoinRoom { room_id } => {
                self.handle_join_room(conn_id, outbound, room_id).await;
            }
            ClientFrame::UpdateProperty { update } => {
                let Some(id) = self.sessions.client_of_connection(conn_id) else {
                    return;
                };
                let Some(room_id) = self.sessions.room_of(&id) else {
                    // Not in a room: the client surfaces its own error.
                    debug!("[client:{id}] update_property outside a room, ignoring");
                    return;
                };
                let Some(room) = self.registry.get(&room_id) else {
                    return;
                };
                let proceed = guarded(
                    "storage_update_requested",
                    true,
                    self.hooks.storage_update_requested(StorageUpdateRequest {
                        room_id: room_id.clone(),
                        client_id: id.clone(),
                        update: update.clone(),
                        storage: room.properties(),
                    }),
                )
                .await;
                if !proceed {
                    warn!("[client:{id}] storage update rejected by host application");
                    reply(
                        outbound,
                        &ServerFrame::PropertyUpdateRejected {
                            state: room.snapshot(),
                        },
                    );
                    return;
                }
                if !self.sessions.is_live_on(&id, conn_id) {
                    return;
                }
                let resolve = |cid: &str| self.sessions.outbound_of(cid);
                match room.apply_and_broadcast(update, &resolve) {
                    Ok(version) => {
                        debug!("[room:{room_id}] v{version} applied from {id}");
                        guarded("storage_updated", (), self.hooks.storage_updated(&room_id)).await;
                    }
                    Err(err) => warn!("[room:{room_id}] dropping update from {id}: {err}"),
                }
            }
            ClientFrame::Request { request } => {
                let Some(id) = self.sessions.client_of_connection(conn_id) else {
                    return;
                };
                let context = RequestContext {
                    room_id: self.sessions.room_of(&id),
                    client_id: id,
                    name: request.name,
                    data: request.data,
                };
                guarded("request_received", (), self.hooks.request_received(context)).await;
            }
            ClientFrame::Disconnect => {
                if let Some(id) = self.sessions.client_of_connection(conn_id)
                    && let Some(session) = self.sessions.session(&id)
                {
                    debug!("[client:{id}] willful disconnect announced");
                    session.willful.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    async fn handle_register(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        outbound: &mpsc::UnboundedSender<Outbound>,
        requested: Option<ClientId>,
        custom_data: Option<Value>,
    ) {
        if self.sessions.client_of_connection(conn_id).is_some() {
            debug!("[conn:{conn_id}] duplicate register, ignoring");
            return;
        }
        let id = match requested {
            Some(requested) => {
                if requested == SERVER_ID || self.sessions.is_id_taken(&requested) {
                    reply(
                        outbound,
                        &ServerFrame::RegistrationFailed {
                            reason: "ID is taken".into(),
                        },
                    );
                    return;
                }
                requested
            }
            None => match self.sessions.mint_client_id() {
                Some(minted) => minted,
                None => {
                    reply(
                        outbound,
                        &ServerFrame::RegistrationFailed {
                            reason: "Could not generate a unique ID".into(),
                        },
                    );
                    return;
                }
            },
        };

        let decision = guarded(
            "client_registration_requested",
            Decision::Allow,
            self.hooks
                .client_registration_requested(&id, custom_data.as_ref()),
        )
        .await;
        if let Some(reason) = decision.reason("Denied") {
            reply(outbound, &ServerFrame::RegistrationFailed { reason });
            return;
        }

        let session_token = id::mint_session_token();
        let session = Arc::new(Session::new(
            id.clone(),
            conn_id,
            outbound.clone(),
            session_token.clone(),
            custom_data,
        ));
        self.sessions.insert(session);
        reply(
            outbound,
            &ServerFrame::Registered {
                id: id.clone(),
                session_token,
            },
        );
        guarded("client_registered", (), self.hooks.client_registered(&id)).await;
        info!("[client:{id}] registered");
    }

    async fn handle_reconnect(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        outbound: &mpsc::UnboundedSender<Outbound>,
        id: ClientId,
        session_token: String,
    ) {
        if self.sessions.client_of_connection(conn_id).is_some() {
            return;
        }
        match self.sessions.try_reclaim(&id, &session_token) {
            Reclaim::Unknown => reply(
                outbound,
                &ServerFrame::ReconnectionFailed {
                    reason: "Client unknown to server".into(),
                },
            ),
            Reclaim::BadToken => reply(
                outbound,
                &ServerFrame::ReconnectionFailed {
                    reason: "Session token does not match".into(),
                },
            ),
            Reclaim::Reclaimed(entry) => {
                entry.timer.abort();
                let session = Arc::new(Session::new(
                    id.clone(),
                    conn_id,
                    outbound.clone(),
                    entry.session.session_token.clone(),
                    entry.session.custom_data.clone(),
                ));
                self.sessions.insert(session);

                let room_data = self
                    .sessions
                    .room_of(&id)
                    .and_then(|room_id| self.registry.get(&room_id))
                    .map(|room| room.room_data());
                if room_data.is_none() {
                    // Room vanished while the client was away; it will
                    // tear itself down on receipt.
                    self.sessions.clear_room(&id);
                }
                reply(outbound, &ServerFrame::Reconnected { room_data });
                info!("[client:{id}] reconnected");
            }
        }
    }

    async fn handle_create_room(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        outbound: &mpsc::UnboundedSender<Outbound>,
        initial_storage: Option<Map<String, Value>>,
        size: Option<usize>,
    ) {
        let Some(id) = self.sessions.client_of_connection(conn_id) else {
            reply(
                outbound,
                &ServerFrame::RoomCreationFailed {
                    reason: "Not registered".into(),
                },
            );
            return;
        };
        if self.sessions.room_of(&id).is_some() {
            reply(
                outbound,
                &ServerFrame::RoomCreationFailed {
                    reason: "Already in a room".into(),
                },
            );
            return;
        }

        let room = match self
            .admit_room(
                &id,
                initial_storage.unwrap_or_default(),
                size,
                Host::Client(id.clone()),
                RoomOwner::Client,
            )
            .await
        {
            Ok(room) => room,
            Err(reason) => {
                reply(outbound, &ServerFrame::RoomCreationFailed { reason });
                return;
            }
        };

        // The creation hook may have suspended; a client that vanished
        // meanwhile gets no room.
        if !self.sessions.is_live_on(&id, conn_id) {
            debug!("[client:{id}] left during room creation, dropping room {}", room.id);
            return;
        }
        room.add_creator(&id);
        self.registry.insert(Arc::clone(&room));
        self.sessions.set_room(&id, room.id.clone());
        reply(
            outbound,
            &ServerFrame::RoomCreated {
                state: room.snapshot(),
                room_id: room.id.clone(),
                size: Some(room.max_size()),
            },
        );
        guarded("room_created", (), self.hooks.room_created(&room.id)).await;
        info!("[room:{}] created by {id}", room.id);
    }

    async fn handle_join_room(
        self: &Arc<Self>,
        conn_id: ConnectionId,
        outbound: &mpsc::UnboundedSender<Outbound>,
        room_id: RoomId,
    ) {
        let rejected = |reason: &str| ServerFrame::JoinRejected {
            reason: reason.into(),
        };
        let Some(id) = self.sessions.client_of_connection(conn_id) else {
            reply(outbound, &rejected("Not registered"));
            return;
        };
        if self.sessions.room_of(&id).is_some() {
            reply(outbound, &rejected("Already in a room"));
            return;
        }
        let Some(room) = self.registry.get(&room_id) else {
            reply(outbound, &rejected("Room not found"));
            return;
        };
        if room.is_full() {
            reply(outbound, &rejected("Room is full"));
            return;
        }

        let decision = guarded(
            "client_join_requested",
            Decision::Allow,
            self.hooks.client_join_requested(&id, &room_id),
        )
        .await;
        if let Some(reason) = decision.reason("Denied") {
            reply(outbound, &ServerFrame::JoinRejected { reason });
            return;
        }
        // Abort if the client disconnected or the room died while the
        // hook was suspended.
        if !self.sessions.is_live_on(&id, conn_id) {
            debug!("[client:{id}] left during join of {room_id}, aborting");
            return;
        }
        if self.registry.get(&room_id).is_none() {
            reply(outbound, &rejected("Room not found"));
            return;
        }

        self.sessions.set_room(&id, room_id.clone());
        let host_is_gone = |host_id: &str| self.sessions.session(host_id).is_none();
        let resolve = |cid: &str| self.sessions.outbound_of(cid);
        match room.try_join(&id, &host_is_gone, &resolve) {
            Some(data) => {
                guarded(
                    "client_joined_room",
                    (),
                    self.hooks.client_joined_room(&id, &room_id),
                )
                .await;
                info!(
                    "[room:{room_id}] {id} joined ({} participant(s))",
                    data.participant_count
                );
            }
            None => {
                self.sessions.clear_room(&id);
                reply(outbound, &rejected("Room is full"));
            }
        }
    }

    async fn handle_transport_closed(self: &Arc<Self>, conn_id: ConnectionId) {
        let Some(session) = self.sessions.take_live_by_connection(conn_id) else {
            return;
        };
        let id = session.id.clone();

        // Leadership moves while the departing client still counts as a
        // participant.
        if let Some(room_id) = self.sessions.room_of(&id)
            && let Some(room) = self.registry.get(&room_id)
        {
            let resolve = |cid: &str| self.sessions.outbound_of(cid);
            room.migrate_host_from(&id, &resolve);
        }

        if session.willful.load(Ordering::SeqCst) || self.is_stopped() {
            info!("[client:{id}] disconnected");
            self.finalize_departure(&id).await;
        } else {
            let server = Arc::clone(self);
            let pending_id = id.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(RECONNECT_GRACE).await;
                server.expire_pending(&pending_id).await;
            });
            self.sessions.insert_pending(PendingDisconnect { session, timer });
        }
    }

    async fn expire_pending(self: &Arc<Self>, id: &str) {
        if self.sessions.take_pending(id).is_none() {
            return;
        }
        info!("[client:{id}] reconnect grace expired");
        self.finalize_departure(id).await;
    }

    async fn finalize_departure(&self, id: &str) {
        if let Some(room_id) = self.sessions.clear_room(id)
            && let Some(room) = self.registry.get(&room_id)
        {
            let resolve = |cid: &str| self.sessions.outbound_of(cid);
            match room.depart(id, &resolve) {
                Departure::DestroyRoom => {
                    self.registry.remove(&room_id);
                    info!("[room:{room_id}] destroyed (last participant left)");
                    guarded("room_destroyed", (), self.hooks.room_destroyed(&room_id)).await;
                }
                Departure::Empty => {}
                Departure::Remaining(count) => {
                    debug!("[room:{room_id}] {id} departed, {count} remaining");
                }
            }
        }
        guarded("client_disconnected", (), self.hooks.client_disconnected(id)).await;
    }

    /// Mint an id, consult the creation hook, build and seed the room.
    /// The room is not yet registered nor populated.
    async fn admit_room(
        &self,
        client_id: &str,
        initial_storage: Map<String, Value>,
        size: Option<usize>,
        host: Host,
        owner: RoomOwner,
    ) -> Result<Arc<Room>, String> {
        let Some(room_id) = self.registry.mint_room_id() else {
            return Err("Could not generate a unique room ID".into());
        };
        let decision = guarded(
            "room_creation_requested",
            CreationDecision::Proceed,
            self.hooks.room_creation_requested(RoomCreationRequest {
                room_id: room_id.clone(),
                client_id: client_id.to_string(),
                initial_storage: initial_storage.clone(),
            }),
        )
        .await;
        let initial_storage = match decision {
            CreationDecision::Deny => return Err("Room creation denied".into()),
            CreationDecision::Proceed => initial_storage,
            CreationDecision::Override(replacement) => replacement,
        };

        let cap = match owner {
            RoomOwner::Client => CLIENT_ROOM_MAX_SIZE,
            RoomOwner::Server => SERVER_ROOM_MAX_SIZE,
        };
        let max_size = size.unwrap_or(cap).clamp(1, cap);
        let room = Arc::new(Room::new(room_id, host, owner, max_size));
        room.seed(initial_storage);
        Ok(room)
    }

    // ------------------------------------------------------------------
    // Host-application interface
    // ------------------------------------------------------------------

    /// Create a server-owned room. With `host`, the given live, roomless
    /// client is seated as first participant and leader; otherwise the
    /// server itself hosts.
    pub async fn create_room(
        &self,
        initial_storage: Option<Map<String, Value>>,
        size: Option<usize>,
        host: Option<ClientId>,
    ) -> Result<(RoomId, StateSnapshot), ServerError> {
        if self.is_stopped() {
            return Err(ServerError::Stopped);
        }
        if let Some(host_id) = &host {
            if self.sessions.session(host_id).is_none() {
                return Err(ServerError::ClientNotFound(host_id.clone()));
            }
            if self.sessions.room_of(host_id).is_some() {
                return Err(ServerError::ClientBusy(host_id.clone()));
            }
        }
        let host_value = match &host {
            Some(host_id) => Host::Client(host_id.clone()),
            None => Host::Server,
        };
        let room = self
            .admit_room(
                SERVER_ID,
                initial_storage.unwrap_or_default(),
                size,
                host_value,
                RoomOwner::Server,
            )
            .await
            .map_err(ServerError::CreationFailed)?;
        if let Some(host_id) = &host {
            room.add_creator(host_id);
            self.sessions.set_room(host_id, room.id.clone());
        }
        self.registry.insert(Arc::clone(&room));
        guarded("room_created", (), self.hooks.room_created(&room.id)).await;
        info!("[room:{}] created by server", room.id);
        Ok((room.id.clone(), room.snapshot()))
    }

    /// Destroy a room, kicking every participant.
    pub async fn destroy_room(&self, room_id: &str) -> Result<(), ServerError> {
        let room = self
            .registry
            .remove(room_id)
            .ok_or_else(|| ServerError::RoomNotFound(room_id.to_string()))?;
        room.for_each_participant(|participant| {
            self.sessions.clear_room(participant);
            if let Some(session) = self.sessions.session(participant) {
                session.willful.store(true, Ordering::SeqCst);
                session.send(&ServerFrame::Kicked {
                    reason: "Room destroyed by server".into(),
                });
                session.close();
            }
        });
        info!("[room:{room_id}] destroyed by server");
        guarded("room_destroyed", (), self.hooks.room_destroyed(room_id)).await;
        Ok(())
    }

    /// Eject a client from the server entirely.
    pub async fn kick(&self, client_id: &str, reason: Option<&str>) -> Result<(), ServerError> {
        let session = self
            .sessions
            .session(client_id)
            .ok_or_else(|| ServerError::ClientNotFound(client_id.to_string()))?;
        session.willful.store(true, Ordering::SeqCst);
        session.send(&ServerFrame::Kicked {
            reason: reason.unwrap_or("Kicked by server").into(),
        });
        session.close();
        info!("[client:{client_id}] kicked");
        Ok(())
    }

    /// The room's materialized storage.
    pub fn room_storage(&self, room_id: &str) -> Result<Map<String, Value>, ServerError> {
        self.registry
            .get(room_id)
            .map(|room| room.properties())
            .ok_or_else(|| ServerError::RoomNotFound(room_id.to_string()))
    }

    /// Server-authoritative storage write: applied, versioned, broadcast.
    pub async fn update_room_storage(
        &self,
        room_id: &str,
        key: &str,
        kind: OpKind,
        value: Value,
        update_value: Option<Value>,
    ) -> Result<(), ServerError> {
        let room = self
            .registry
            .get(room_id)
            .ok_or_else(|| ServerError::RoomNotFound(room_id.to_string()))?;
        let resolve = |cid: &str| self.sessions.outbound_of(cid);
        let version = room.update_local_and_broadcast(key, kind, value, update_value, &resolve)?;
        debug!("[room:{room_id}] v{version} applied by server");
        guarded("storage_updated", (), self.hooks.storage_updated(room_id)).await;
        Ok(())
    }

    /// Point-in-time summaries of every room.
    pub fn rooms(&self) -> Vec<RoomSummary> {
        self.registry.summaries()
    }

    /// Orderly shutdown: kick every live client, cancel every timer,
    /// release the listener.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("server stopping");
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        self.sessions.abort_all_pending();
        for session in self.sessions.drain_live() {
            session.send(&ServerFrame::Kicked {
                reason: "Server restart.".into(),
            });
            session.send(&ServerFrame::ServerStopped);
            session.close();
        }
        self.registry.clear();
        self.shutdown.notify_waiters();
    }
}

/// Ping every live transport each interval; whoever missed answering
/// the previous ping is terminated.
async fn heartbeat_loop(server: std::sync::Weak<SyncServer>) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(server) = server.upgrade() else {
            break;
        };
        for session in server.sessions.live_sessions() {
            if !session.alive.swap(false, Ordering::SeqCst) {
                warn!("[client:{}] unresponsive transport, terminating", session.id);
                session.close();
            } else {
                session.ping();
            }
        }
    }
}
