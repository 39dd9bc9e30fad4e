//! The client state machine.
//!
//! A [`SyncClient`] owns its own CRDT replica and mirrors the server's
//! room state. Mutations apply optimistically before they are sent; the
//! server's echo imports idempotently. Only one of `init`,
//! `create_room`, `join_room` or the internal reconnect may be in
//! flight at a time, each bounded by a 3 s timeout. A dropped transport
//! triggers up to nine reconnection attempts at 500 ms cadence before
//! the instance destroys itself.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use unison_core::engine::CrdtEngine;
use unison_core::limits::{RECONNECT_ATTEMPTS, RECONNECT_DELAY, REQUEST_TIMEOUT};
use unison_core::op::OpKind;
use unison_core::protocol::{
    AppRequest, ClientFrame, ClientId, Host, PropertyUpdate, RoomId, ServerFrame,
};
use unison_core::transport::SocketEvent;

use crate::connector::{Connector, WsConnector};
use crate::error::ClientError;
use crate::events::ClientEvent;

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Server endpoint URL, e.g. `ws://127.0.0.1:8080/`.
    pub endpoint: String,
    /// Registration payload forwarded to the host application.
    pub custom_data: Option<Value>,
}

struct State {
    engine: CrdtEngine,
    client_id: Option<ClientId>,
    session_token: Option<String>,
    room_id: Option<RoomId>,
    host: Option<Host>,
    participant_count: usize,
    expected_version: u64,
    socket: Option<mpsc::UnboundedSender<Vec<u8>>>,
    pending: Option<oneshot::Sender<ServerFrame>>,
    /// Room id of the in-flight join; `join_accepted` carries none.
    pending_room: Option<RoomId>,
    /// Bumped per installed socket; stale reader tasks compare it.
    generation: u64,
    reconnecting: bool,
    destroyed: bool,
}

struct Shared {
    connector: Arc<dyn Connector>,
    custom_data: Option<Value>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: Mutex<State>,
    /// Single-flight gate over init/create/join/reconnect.
    op_gate: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct SyncClient {
    shared: Arc<Shared>,
}

impl SyncClient {
    /// Build a client over an arbitrary connector. Returns the client
    /// and its event stream.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            connector,
            custom_data: config.custom_data,
            events: event_tx,
            state: Mutex::new(State {
                engine: CrdtEngine::new(),
                client_id: None,
                session_token: None,
                room_id: None,
                host: None,
                participant_count: 0,
                expected_version: 0,
                socket: None,
                pending: None,
                pending_room: None,
                generation: 0,
                reconnecting: false,
                destroyed: false,
            }),
            op_gate: tokio::sync::Mutex::new(()),
        });
        (Self { shared }, event_rx)
    }

    /// Build a client dialing the configured WebSocket endpoint.
    pub fn over_websocket(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let connector = Arc::new(WsConnector::new(&config.endpoint)?);
        Ok(Self::new(config, connector))
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn client_id(&self) -> Option<ClientId> {
        self.shared.state.lock().client_id.clone()
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.shared.state.lock().room_id.clone()
    }

    /// The local materialized storage.
    pub fn storage(&self) -> Map<String, Value> {
        self.shared.state.lock().engine.properties().clone()
    }

    pub fn is_host(&self) -> bool {
        let state = self.shared.state.lock();
        match (&state.host, &state.client_id) {
            (Some(host), Some(id)) => host.is_client(id),
            _ => false,
        }
    }

    pub fn participant_count(&self) -> usize {
        self.shared.state.lock().participant_count
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().destroyed
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Connect and register. Resolves to the assigned client id.
    pub async fn init(&self) -> Result<ClientId, ClientError> {
        let _gate = self.shared.op_gate.lock().await;
        if self.is_destroyed() {
            return Err(ClientError::Destroyed);
        }
        let socket = self.shared.connector.connect().await?;
        self.shared.install_socket(socket);

        let frame = ClientFrame::Register {
            id: None,
            custom_data: self.shared.custom_data.clone(),
        };
        match self.shared.round_trip(frame).await? {
            ServerFrame::Registered { id, .. } => Ok(id),
            ServerFrame::RegistrationFailed { reason } => Err(ClientError::Rejected(reason)),
            _ => Err(ClientError::UnexpectedFrame),
        }
    }

    /// Create a room owned by this client and enter it.
    pub async fn create_room(
        &self,
        initial_storage: Option<Map<String, Value>>,
        size: Option<usize>,
    ) -> Result<RoomId, ClientError> {
        let _gate = self.shared.op_gate.lock().await;
        self.check_roomless()?;
        let frame = ClientFrame::CreateRoom {
            initial_storage,
            size,
        };
        match self.shared.round_trip(frame).await? {
            ServerFrame::RoomCreated { room_id, .. } => Ok(room_id),
            ServerFrame::RoomCreationFailed { reason } => Err(ClientError::Rejected(reason)),
            _ => Err(ClientError::UnexpectedFrame),
        }
    }

    /// Join an existing room.
    pub async fn join_room(&self, room_id: &str) -> Result<(), ClientError> {
        let _gate = self.shared.op_gate.lock().await;
        self.check_roomless()?;
        self.shared.state.lock().pending_room = Some(room_id.to_string());
        let frame = ClientFrame::JoinRoom {
            room_id: room_id.to_string(),
        };
        let outcome = match self.shared.round_trip(frame).await {
            Ok(ServerFrame::JoinAccepted { .. }) => Ok(()),
            Ok(ServerFrame::JoinRejected { reason }) => Err(ClientError::Rejected(reason)),
            Ok(_) => Err(ClientError::UnexpectedFrame),
            Err(err) => Err(err),
        };
        if outcome.is_err() {
            self.shared.state.lock().pending_room = None;
        }
        outcome
    }

    /// Mutate shared storage: applied locally first, then sent. Fails
    /// locally when not in a room or when the value is oversize.
    pub fn update_property(
        &self,
        key: &str,
        kind: OpKind,
        value: Value,
        update_value: Option<Value>,
    ) -> Result<(), ClientError> {
        let changed = {
            let mut state = self.shared.state.lock();
            if state.destroyed {
                return Err(ClientError::Destroyed);
            }
            if state.room_id.is_none() {
                return Err(ClientError::NotInRoom);
            }
            let update = state.engine.update_property(key, kind, value, update_value)?;
            if let Some(socket) = &state.socket {
                let _ = socket.send(ClientFrame::UpdateProperty { update }.encode());
            }
            state.engine.properties_changed()
        };
        if changed {
            self.shared.emit(ClientEvent::StorageUpdated);
        }
        Ok(())
    }

    /// Fire-and-forget application request relayed to the host app.
    pub fn request(&self, name: &str, data: Option<Value>) -> Result<(), ClientError> {
        let state = self.shared.state.lock();
        if state.destroyed {
            return Err(ClientError::Destroyed);
        }
        let Some(socket) = &state.socket else {
            return Err(ClientError::NotConnected);
        };
        let frame = ClientFrame::Request {
            request: AppRequest {
                name: name.to_string(),
                data,
            },
        };
        let _ = socket.send(frame.encode());
        Ok(())
    }

    /// Willful departure: no reconnection grace, immediate teardown.
    pub fn disconnect(&self) {
        {
            let state = self.shared.state.lock();
            if let Some(socket) = &state.socket {
                let _ = socket.send(ClientFrame::Disconnect.encode());
            }
        }
        self.shared.destroy();
    }

    fn check_roomless(&self) -> Result<(), ClientError> {
        let state = self.shared.state.lock();
        if state.destroyed {
            return Err(ClientError::Destroyed);
        }
        if state.client_id.is_none() {
            return Err(ClientError::NotRegistered);
        }
        if state.room_id.is_some() {
            return Err(ClientError::AlreadyInRoom);
        }
        Ok(())
    }
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Install a freshly dialed socket and spawn its reader task.
    fn install_socket(self: &Arc<Self>, socket: unison_core::transport::ClientSocket) {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.socket = Some(socket.outbound);
            state.generation
        };
        let shared = Arc::clone(self);
        let mut events = socket.events;
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SocketEvent::Frame(bytes) => {
                        let Some(frame) = ServerFrame::decode(&bytes) else {
                            warn!("[client] undecodable frame ({} bytes)", bytes.len());
                            continue;
                        };
                        shared.handle_frame(frame, generation);
                    }
                    SocketEvent::Closed => break,
                }
            }
            shared.on_socket_closed(generation);
        });
    }

    /// Send one frame and await the matching response.
    async fn round_trip(&self, frame: ClientFrame) -> Result<ServerFrame, ClientError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(ClientError::Destroyed);
            }
            let Some(socket) = state.socket.clone() else {
                return Err(ClientError::NotConnected);
            };
            state.pending = Some(tx);
            let _ = socket.send(frame.encode());
        }
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.state.lock().pending = None;
                Err(ClientError::Timeout)
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: ServerFrame, generation: u64) {
        {
            let state = self.state.lock();
            if state.generation != generation || state.destroyed {
                return;
            }
        }
        match frame {
            ServerFrame::Registered { .. }
            | ServerFrame::RegistrationFailed { .. }
            | ServerFrame::RoomCreated { .. }
            | ServerFrame::RoomCreationFailed { .. }
            | ServerFrame::JoinAccepted { .. }
            | ServerFrame::JoinRejected { .. }
            | ServerFrame::Reconnected { .. }
            | ServerFrame::ReconnectionFailed { .. } => self.handle_response(frame),
            ServerFrame::PropertyUpdated { update, version } => {
                self.on_property_updated(update, version);
            }
            ServerFrame::PropertyUpdateRejected { state: snapshot } => {
                let changed = {
                    let mut state = self.state.lock();
                    state.engine.import_state(snapshot);
                    state.engine.properties_changed()
                };
                self.emit(ClientEvent::Error {
                    message: "Storage update rejected by the server".into(),
                });
                if changed {
                    self.emit(ClientEvent::StorageUpdated);
                }
            }
            ServerFrame::ClientConnected {
                client,
                participant_count,
            } => {
                self.state.lock().participant_count = participant_count;
                self.emit(ClientEvent::ClientJoined {
                    client,
                    participant_count,
                });
            }
            ServerFrame::ClientDisconnected {
                client,
                participant_count,
            } => {
                self.state.lock().participant_count = participant_count;
                self.emit(ClientEvent::ClientLeft {
                    client,
                    participant_count,
                });
            }
            ServerFrame::HostMigrated { new_host } => {
                let is_host = {
                    let mut state = self.state.lock();
                    state.host = Some(new_host.clone());
                    state
                        .client_id
                        .as_deref()
                        .is_some_and(|id| new_host.is_client(id))
                };
                self.emit(ClientEvent::HostChanged { new_host, is_host });
            }
            ServerFrame::Kicked { reason } => {
                self.emit(ClientEvent::Kicked { reason });
                self.destroy();
            }
            ServerFrame::ServerStopped => {
                self.destroy();
            }
        }
    }

    /// Responses update state before waking the caller, so the caller
    /// resumes against a consistent view.
    fn handle_response(self: &Arc<Self>, frame: ServerFrame) {
        let pending = self.state.lock().pending.take();
        let mut destroy_after = false;
        match &frame {
            ServerFrame::Registered { id, session_token } => {
                {
                    let mut state = self.state.lock();
                    state.client_id = Some(id.clone());
                    state.session_token = Some(session_token.clone());
                }
                info!("[client:{id}] registered");
                self.emit(ClientEvent::Registered { id: id.clone() });
            }
            ServerFrame::RoomCreated { state: snapshot, room_id, .. } => {
                let changed = {
                    let mut state = self.state.lock();
                    state.engine.import_state(snapshot.clone());
                    state.room_id = Some(room_id.clone());
                    state.host = state.client_id.clone().map(Host::Client);
                    state.participant_count = 1;
                    state.expected_version = 0;
                    state.engine.properties_changed()
                };
                self.emit(ClientEvent::RoomCreated {
                    room_id: room_id.clone(),
                });
                if changed {
                    self.emit(ClientEvent::StorageUpdated);
                }
            }
            ServerFrame::JoinAccepted {
                state: snapshot,
                participant_count,
                host,
                version,
            } => {
                let (room_id, changed) = {
                    let mut state = self.state.lock();
                    state.engine.import_state(snapshot.clone());
                    state.room_id = state.pending_room.take();
                    state.host = Some(host.clone());
                    state.participant_count = *participant_count;
                    state.expected_version = *version;
                    (state.room_id.clone(), state.engine.properties_changed())
                };
                if let Some(room_id) = room_id {
                    self.emit(ClientEvent::RoomJoined { room_id });
                }
                if changed {
                    self.emit(ClientEvent::StorageUpdated);
                }
            }
            ServerFrame::Reconnected { room_data } => match room_data {
                Some(data) => {
                    let changed = {
                        let mut state = self.state.lock();
                        // A resumed session is a fresh replica; prior
                        // clock entries survive as history in the import.
                        state.engine = CrdtEngine::new();
                        state.engine.import_state(data.state.clone());
                        state.host = Some(data.host.clone());
                        state.participant_count = data.participant_count;
                        state.expected_version = data.version;
                        state.reconnecting = false;
                        state.engine.properties_changed()
                    };
                    info!("[client] session resumed");
                    self.emit(ClientEvent::Reconnected);
                    if changed {
                        self.emit(ClientEvent::StorageUpdated);
                    }
                }
                None => {
                    debug!("[client] room gone after reconnect, destroying");
                    destroy_after = true;
                }
            },
            ServerFrame::RegistrationFailed { reason }
            | ServerFrame::RoomCreationFailed { reason }
            | ServerFrame::JoinRejected { reason }
            | ServerFrame::ReconnectionFailed { reason } => {
                self.emit(ClientEvent::Error {
                    message: reason.clone(),
                });
            }
            _ => {}
        }
        if let Some(tx) = pending {
            let _ = tx.send(frame);
        }
        if destroy_after {
            self.destroy();
        }
    }

    fn on_property_updated(self: &Arc<Self>, update: PropertyUpdate, version: u64) {
        let changed = {
            let mut state = self.state.lock();
            if state.room_id.is_none() {
                return;
            }
            if version != state.expected_version + 1 {
                warn!(
                    "[client] version fence violated (expected {}, got {version}), forcing resync",
                    state.expected_version + 1
                );
                // Dropping the socket closes the transport; the
                // reconnection path resends full state.
                state.socket = None;
                return;
            }
            state.expected_version = version;
            if let Err(err) = state.engine.import_property_update(update) {
                warn!("[client] dropping broadcast update: {err}");
            }
            state.engine.properties_changed()
        };
        if changed {
            self.emit(ClientEvent::StorageUpdated);
        }
    }

    fn on_socket_closed(self: &Arc<Self>, generation: u64) {
        let should_reconnect = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.socket = None;
            state.pending = None;
            !state.destroyed && !state.reconnecting && state.session_token.is_some()
        };
        if !should_reconnect {
            return;
        }
        self.emit(ClientEvent::Disconnected);
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.reconnect_loop().await;
        });
    }

    async fn reconnect_loop(self: &Arc<Self>) {
        let _gate = self.op_gate.lock().await;
        {
            let mut state = self.state.lock();
            if state.destroyed || state.reconnecting || state.socket.is_some() {
                return;
            }
            state.reconnecting = true;
        }
        for attempt in 1..=RECONNECT_ATTEMPTS {
            tokio::time::sleep(RECONNECT_DELAY).await;
            let (id, token) = {
                let state = self.state.lock();
                if state.destroyed {
                    return;
                }
                match (state.client_id.clone(), state.session_token.clone()) {
                    (Some(id), Some(token)) => (id, token),
                    _ => return,
                }
            };
            info!("[client:{id}] reconnect attempt {attempt}/{RECONNECT_ATTEMPTS}");
            let socket = match self.connector.connect().await {
                Ok(socket) => socket,
                Err(err) => {
                    debug!("[client:{id}] reconnect dial failed: {err}");
                    continue;
                }
            };
            self.install_socket(socket);
            let frame = ClientFrame::Reconnect {
                id: id.clone(),
                session_token: token,
            };
            match self.round_trip(frame).await {
                Ok(ServerFrame::Reconnected { .. }) => {
                    // State already applied (or the instance destroyed
                    // itself when the room was gone).
                    return;
                }
                Ok(ServerFrame::ReconnectionFailed { reason }) => {
                    warn!("[client:{id}] reconnect refused: {reason}");
                }
                Ok(_) => {}
                Err(err) => {
                    debug!("[client:{id}] reconnect round trip failed: {err}");
                }
            }
        }
        warn!("[client] reconnection failed, destroying instance");
        self.state.lock().reconnecting = false;
        self.destroy();
    }

    fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.socket = None;
            state.pending = None;
            state.room_id = None;
            state.host = None;
        }
        self.emit(ClientEvent::InstanceDestroyed);
    }
}
