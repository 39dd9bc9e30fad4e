//! Frame-level integration tests: a raw peer speaking the binary
//! protocol against a full server over the in-memory transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use unison_core::op::OpKind;
use unison_core::protocol::{ClientFrame, Host, PropertyUpdate, ServerFrame};
use unison_core::transport::{memory, SocketEvent};
use unison_core::CrdtEngine;
use unison_server::hooks::{
    CreationDecision, Decision, Hooks, NoHooks, RequestContext, RoomCreationRequest,
    StorageUpdateRequest,
};
use unison_server::{ServerConfig, SyncServer};

struct Peer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<SocketEvent>,
}

impl Peer {
    fn connect(server: &Arc<SyncServer>) -> Self {
        let (socket, conn) = memory::pair();
        server.accept(conn);
        Self {
            tx: socket.outbound,
            rx: socket.events,
        }
    }

    fn send(&self, frame: &ClientFrame) {
        self.tx.send(frame.encode()).expect("transport open");
    }

    async fn recv(&mut self) -> ServerFrame {
        loop {
            let event = timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("transport closed");
            match event {
                SocketEvent::Frame(bytes) => {
                    return ServerFrame::decode(&bytes).expect("decodable frame");
                }
                SocketEvent::Closed => panic!("transport closed while expecting frame"),
            }
        }
    }

    async fn recv_closed(&mut self) {
        loop {
            match timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .expect("timed out waiting for close")
            {
                Some(SocketEvent::Closed) | None => return,
                Some(SocketEvent::Frame(_)) => continue,
            }
        }
    }

    async fn register(&mut self) -> (String, String) {
        self.send(&ClientFrame::Register {
            id: None,
            custom_data: None,
        });
        match self.recv().await {
            ServerFrame::Registered { id, session_token } => (id, session_token),
            other => panic!("expected registered, got {other:?}"),
        }
    }

    async fn create_room(&mut self, initial: Option<Map<String, Value>>) -> String {
        self.send(&ClientFrame::CreateRoom {
            initial_storage: initial,
            size: None,
        });
        match self.recv().await {
            ServerFrame::RoomCreated { room_id, .. } => room_id,
            other => panic!("expected room_created, got {other:?}"),
        }
    }

    async fn join_room(&mut self, room_id: &str) -> ServerFrame {
        self.send(&ClientFrame::JoinRoom {
            room_id: room_id.to_string(),
        });
        self.recv().await
    }
}

fn server() -> Arc<SyncServer> {
    SyncServer::new(ServerConfig::default(), Arc::new(NoHooks))
}

fn update_for(key: &str, value: Value) -> PropertyUpdate {
    let mut engine = CrdtEngine::new();
    engine
        .update_property(key, OpKind::Set, value, None)
        .expect("valid update")
}

#[tokio::test]
async fn test_register_mints_id_and_token() {
    let server = server();
    let mut peer = Peer::connect(&server);
    let (id, token) = peer.register().await;
    assert_eq!(id.len(), 6);
    assert_eq!(token.len(), 16);
    assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
}

#[tokio::test]
async fn test_register_requested_id_and_collision() {
    let server = server();
    let mut first = Peer::connect(&server);
    first.send(&ClientFrame::Register {
        id: Some("FRIEND".into()),
        custom_data: None,
    });
    assert!(matches!(
        first.recv().await,
        ServerFrame::Registered { id, .. } if id == "FRIEND"
    ));

    let mut second = Peer::connect(&server);
    second.send(&ClientFrame::Register {
        id: Some("FRIEND".into()),
        custom_data: None,
    });
    match second.recv().await {
        ServerFrame::RegistrationFailed { reason } => assert_eq!(reason, "ID is taken"),
        other => panic!("expected registration_failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_register_server_id_refused() {
    let server = server();
    let mut peer = Peer::connect(&server);
    peer.send(&ClientFrame::Register {
        id: Some("server".into()),
        custom_data: None,
    });
    match peer.recv().await {
        ServerFrame::RegistrationFailed { reason } => assert_eq!(reason, "ID is taken"),
        other => panic!("expected registration_failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_room_requires_registration() {
    let server = server();
    let mut peer = Peer::connect(&server);
    peer.send(&ClientFrame::CreateRoom {
        initial_storage: None,
        size: None,
    });
    match peer.recv().await {
        ServerFrame::RoomCreationFailed { reason } => assert_eq!(reason, "Not registered"),
        other => panic!("expected room_creation_failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_join_and_broadcast_versions() {
    let server = server();
    let mut alice = Peer::connect(&server);
    let mut bob = Peer::connect(&server);
    let (alice_id, _) = alice.register().await;
    let (bob_id, _) = bob.register().await;

    let mut initial = Map::new();
    initial.insert("topic".into(), json!("lobby"));
    let room_id = alice.create_room(Some(initial)).await;
    assert_eq!(room_id.len(), 6);

    match bob.join_room(&room_id).await {
        ServerFrame::JoinAccepted {
            participant_count,
            host,
            version,
            state,
        } => {
            assert_eq!(participant_count, 2);
            assert_eq!(host, Host::Client(alice_id.clone()));
            assert_eq!(version, 0);
            let mut engine = CrdtEngine::new();
            engine.import_state(state);
            assert_eq!(engine.properties()["topic"], json!("lobby"));
        }
        other => panic!("expected join_accepted, got {other:?}"),
    }

    // Alice sees the arrival.
    match alice.recv().await {
        ServerFrame::ClientConnected {
            client,
            participant_count,
        } => {
            assert_eq!(client, bob_id);
            assert_eq!(participant_count, 2);
        }
        other => panic!("expected client_connected, got {other:?}"),
    }

    // Two updates from Bob serialize with strictly increasing versions,
    // broadcast to both participants.
    bob.send(&ClientFrame::UpdateProperty {
        update: update_for("turn", json!(1)),
    });
    bob.send(&ClientFrame::UpdateProperty {
        update: update_for("turn", json!(2)),
    });
    for peer in [&mut alice, &mut bob] {
        let mut versions = Vec::new();
        for _ in 0..2 {
            match peer.recv().await {
                ServerFrame::PropertyUpdated { version, .. } => versions.push(version),
                other => panic!("expected property_updated, got {other:?}"),
            }
        }
        assert_eq!(versions, vec![1, 2]);
    }
}

#[tokio::test]
async fn test_join_unknown_room_rejected() {
    let server = server();
    let mut peer = Peer::connect(&server);
    peer.register().await;
    match peer.join_room("NOROOM").await {
        ServerFrame::JoinRejected { reason } => assert_eq!(reason, "Room not found"),
        other => panic!("expected join_rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_full_room_rejected() {
    let server = server();
    let mut alice = Peer::connect(&server);
    alice.register().await;
    alice.send(&ClientFrame::CreateRoom {
        initial_storage: None,
        size: Some(1),
    });
    let room_id = match alice.recv().await {
        ServerFrame::RoomCreated { room_id, size, .. } => {
            assert_eq!(size, Some(1));
            room_id
        }
        other => panic!("expected room_created, got {other:?}"),
    };

    let mut bob = Peer::connect(&server);
    bob.register().await;
    match bob.join_room(&room_id).await {
        ServerFrame::JoinRejected { reason } => assert_eq!(reason, "Room is full"),
        other => panic!("expected join_rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_double_join_rejected() {
    let server = server();
    let mut alice = Peer::connect(&server);
    alice.register().await;
    let room_id = alice.create_room(None).await;
    match alice.join_room(&room_id).await {
        ServerFrame::JoinRejected { reason } => assert_eq!(reason, "Already in a room"),
        other => panic!("expected join_rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_willful_disconnect_destroys_client_owned_room() {
    let server = server();
    let mut alice = Peer::connect(&server);
    alice.register().await;
    let room_id = alice.create_room(None).await;
    assert_eq!(server.rooms().len(), 1);

    alice.send(&ClientFrame::Disconnect);
    drop(alice);

    // Teardown is immediate: no reconnection grace for willful leavers.
    let mut bob = Peer::connect(&server);
    bob.register().await;
    match bob.join_room(&room_id).await {
        ServerFrame::JoinRejected { reason } => assert_eq!(reason, "Room not found"),
        other => panic!("expected join_rejected, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_grace_expiry_removes_participant() {
    let server = server();
    let mut alice = Peer::connect(&server);
    let mut bob = Peer::connect(&server);
    let (_, _) = alice.register().await;
    let (bob_id, _) = bob.register().await;
    let room_id = alice.create_room(None).await;
    bob.join_room(&room_id).await;
    alice.recv().await; // client_connected

    // Bob's transport drops without a disconnect frame.
    drop(bob);

    // After the grace period the departure is final.
    match alice.recv().await {
        ServerFrame::ClientDisconnected {
            client,
            participant_count,
        } => {
            assert_eq!(client, bob_id);
            assert_eq!(participant_count, 1);
        }
        other => panic!("expected client_disconnected, got {other:?}"),
    }
    let rooms = server.rooms();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].participant_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_within_grace() {
    let server = server();
    let mut alice = Peer::connect(&server);
    let (id, token) = alice.register().await;
    let room_id = alice.create_room(None).await;
    server
        .update_room_storage(&room_id, "score", OpKind::Set, json!(10), None)
        .await
        .unwrap();
    alice.recv().await; // property_updated v1

    drop(alice);

    let mut revived = Peer::connect(&server);
    revived.send(&ClientFrame::Reconnect {
        id: id.clone(),
        session_token: token,
    });
    match revived.recv().await {
        ServerFrame::Reconnected { room_data } => {
            let data = room_data.expect("room still alive");
            assert_eq!(data.version, 1);
            assert_eq!(data.participant_count, 1);
            let mut engine = CrdtEngine::new();
            engine.import_state(data.state);
            assert_eq!(engine.properties()["score"], json!(10));
        }
        other => panic!("expected reconnected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reconnect_wrong_token_and_unknown_id() {
    let server = server();
    let mut alice = Peer::connect(&server);
    let (id, _token) = alice.register().await;
    drop(alice);

    let mut stranger = Peer::connect(&server);
    stranger.send(&ClientFrame::Reconnect {
        id: id.clone(),
        session_token: "0123456789abcdef".into(),
    });
    match stranger.recv().await {
        ServerFrame::ReconnectionFailed { reason } => {
            assert_eq!(reason, "Session token does not match");
        }
        other => panic!("expected reconnection_failed, got {other:?}"),
    }

    stranger.send(&ClientFrame::Reconnect {
        id: "GHOST9".into(),
        session_token: "0123456789abcdef".into(),
    });
    match stranger.recv().await {
        ServerFrame::ReconnectionFailed { reason } => {
            assert_eq!(reason, "Client unknown to server");
        }
        other => panic!("expected reconnection_failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_host_migration_on_transport_drop() {
    let server = server();
    let mut p1 = Peer::connect(&server);
    let mut p2 = Peer::connect(&server);
    let mut p3 = Peer::connect(&server);
    p1.register().await;
    let (p2_id, _) = p2.register().await;
    p3.register().await;

    let room_id = p1.create_room(None).await;
    p2.join_room(&room_id).await;
    p3.join_room(&room_id).await;

    drop(p1);

    // Migration happens at transport close, inside the grace window.
    let mut saw = Vec::new();
    for peer in [&mut p2, &mut p3] {
        loop {
            match peer.recv().await {
                ServerFrame::HostMigrated { new_host } => {
                    saw.push(new_host);
                    break;
                }
                ServerFrame::ClientConnected { .. } => continue,
                other => panic!("expected host_migrated, got {other:?}"),
            }
        }
    }
    assert_eq!(
        saw,
        vec![
            Host::Client(p2_id.clone()),
            Host::Client(p2_id.clone())
        ]
    );
    assert_eq!(server.rooms()[0].host, Host::Client(p2_id));
}

#[tokio::test]
async fn test_joiner_promoted_when_host_pending() {
    let server = server();
    let mut host = Peer::connect(&server);
    host.register().await;
    let room_id = host.create_room(None).await;
    drop(host); // enters pending-disconnect, stays a participant

    let mut joiner = Peer::connect(&server);
    let (joiner_id, _) = joiner.register().await;
    match joiner.join_room(&room_id).await {
        ServerFrame::JoinAccepted { host, .. } => {
            assert_eq!(host, Host::Client(joiner_id));
        }
        other => panic!("expected join_accepted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rate_limit_terminates_transport() {
    let mut config = ServerConfig::default();
    config.rate_limit_capacity = 3;
    let server = SyncServer::new(config, Arc::new(NoHooks));
    let mut peer = Peer::connect(&server);
    peer.register().await;
    // Burn through the remaining tokens inside one refill window.
    for _ in 0..5 {
        peer.send(&ClientFrame::Request {
            request: unison_core::protocol::AppRequest {
                name: "noop".into(),
                data: None,
            },
        });
    }
    peer.recv_closed().await;
}

#[tokio::test]
async fn test_stop_kicks_everyone() {
    let server = server();
    let mut peer = Peer::connect(&server);
    peer.register().await;
    server.stop().await;
    match peer.recv().await {
        ServerFrame::Kicked { reason } => assert_eq!(reason, "Server restart."),
        other => panic!("expected kicked, got {other:?}"),
    }
    assert!(matches!(peer.recv().await, ServerFrame::ServerStopped));
    peer.recv_closed().await;
    assert!(server.rooms().is_empty());
}

#[tokio::test]
async fn test_destroy_room_kicks_participants() {
    let server = server();
    let mut alice = Peer::connect(&server);
    alice.register().await;
    let room_id = alice.create_room(None).await;

    server.destroy_room(&room_id).await.unwrap();
    match alice.recv().await {
        ServerFrame::Kicked { reason } => assert_eq!(reason, "Room destroyed by server"),
        other => panic!("expected kicked, got {other:?}"),
    }
    assert!(server.rooms().is_empty());
}

#[tokio::test]
async fn test_server_owned_room_persists_and_serves_updates() {
    let server = server();
    let (room_id, _state) = server.create_room(None, None, None).await.unwrap();
    assert_eq!(server.rooms()[0].host, Host::Server);

    let mut alice = Peer::connect(&server);
    alice.register().await;
    alice.join_room(&room_id).await;

    server
        .update_room_storage(&room_id, "motd", OpKind::Set, json!("welcome"), None)
        .await
        .unwrap();
    match alice.recv().await {
        ServerFrame::PropertyUpdated { version, update } => {
            assert_eq!(version, 1);
            assert_eq!(update.key, "motd");
        }
        other => panic!("expected property_updated, got {other:?}"),
    }

    // Emptying a server-owned room leaves it standing.
    alice.send(&ClientFrame::Disconnect);
    drop(alice);
    let mut bob = Peer::connect(&server);
    bob.register().await;
    assert!(matches!(
        bob.join_room(&room_id).await,
        ServerFrame::JoinAccepted { .. }
    ));
    assert_eq!(
        server.room_storage(&room_id).unwrap()["motd"],
        json!("welcome")
    );
}

// ----------------------------------------------------------------------
// Hook behavior
// ----------------------------------------------------------------------

struct GatedHooks {
    deny_registration: AtomicBool,
    deny_join: AtomicBool,
    reject_updates: AtomicBool,
    override_storage: AtomicBool,
    requests_seen: AtomicUsize,
}

impl GatedHooks {
    fn new() -> Self {
        Self {
            deny_registration: AtomicBool::new(false),
            deny_join: AtomicBool::new(false),
            reject_updates: AtomicBool::new(false),
            override_storage: AtomicBool::new(false),
            requests_seen: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Hooks for GatedHooks {
    async fn client_registration_requested(
        &self,
        _id: &str,
        _custom_data: Option<&Value>,
    ) -> Decision {
        if self.deny_registration.load(Ordering::SeqCst) {
            Decision::DenyWith("No seats left".into())
        } else {
            Decision::Allow
        }
    }

    async fn client_join_requested(&self, _id: &str, _room_id: &str) -> Decision {
        if self.deny_join.load(Ordering::SeqCst) {
            Decision::Deny
        } else {
            Decision::Allow
        }
    }

    async fn room_creation_requested(&self, request: RoomCreationRequest) -> CreationDecision {
        if self.override_storage.load(Ordering::SeqCst) {
            let mut replacement = request.initial_storage.clone();
            replacement.insert("stamped".into(), json!(true));
            CreationDecision::Override(replacement)
        } else {
            CreationDecision::Proceed
        }
    }

    async fn storage_update_requested(&self, _request: StorageUpdateRequest) -> bool {
        !self.reject_updates.load(Ordering::SeqCst)
    }

    async fn request_received(&self, request: RequestContext) {
        assert_eq!(request.name, "ping");
        self.requests_seen.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_registration_hook_denies_with_reason() {
    let hooks = Arc::new(GatedHooks::new());
    hooks.deny_registration.store(true, Ordering::SeqCst);
    let server = SyncServer::new(ServerConfig::default(), hooks);
    let mut peer = Peer::connect(&server);
    peer.send(&ClientFrame::Register {
        id: None,
        custom_data: None,
    });
    match peer.recv().await {
        ServerFrame::RegistrationFailed { reason } => assert_eq!(reason, "No seats left"),
        other => panic!("expected registration_failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_hook_denies_with_default_reason() {
    let hooks = Arc::new(GatedHooks::new());
    let server = SyncServer::new(ServerConfig::default(), hooks.clone());
    let mut alice = Peer::connect(&server);
    alice.register().await;
    let room_id = alice.create_room(None).await;

    hooks.deny_join.store(true, Ordering::SeqCst);
    let mut bob = Peer::connect(&server);
    bob.register().await;
    match bob.join_room(&room_id).await {
        ServerFrame::JoinRejected { reason } => assert_eq!(reason, "Denied"),
        other => panic!("expected join_rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_creation_hook_overrides_initial_storage() {
    let hooks = Arc::new(GatedHooks::new());
    hooks.override_storage.store(true, Ordering::SeqCst);
    let server = SyncServer::new(ServerConfig::default(), hooks);
    let mut alice = Peer::connect(&server);
    alice.register().await;

    let mut initial = Map::new();
    initial.insert("mine".into(), json!(1));
    alice.send(&ClientFrame::CreateRoom {
        initial_storage: Some(initial),
        size: None,
    });
    match alice.recv().await {
        ServerFrame::RoomCreated { state, .. } => {
            let mut engine = CrdtEngine::new();
            engine.import_state(state);
            assert_eq!(engine.properties()["mine"], json!(1));
            assert_eq!(engine.properties()["stamped"], json!(true));
        }
        other => panic!("expected room_created, got {other:?}"),
    }
}

#[tokio::test]
async fn test_update_hook_rejection_resyncs_author() {
    let hooks = Arc::new(GatedHooks::new());
    let server = SyncServer::new(ServerConfig::default(), hooks.clone());
    let mut alice = Peer::connect(&server);
    alice.register().await;
    let mut initial = Map::new();
    initial.insert("val".into(), json!("honest"));
    let room_id = alice.create_room(Some(initial)).await;

    hooks.reject_updates.store(true, Ordering::SeqCst);
    alice.send(&ClientFrame::UpdateProperty {
        update: update_for("val", json!("hacked")),
    });
    match alice.recv().await {
        ServerFrame::PropertyUpdateRejected { state } => {
            let mut engine = CrdtEngine::new();
            engine.import_state(state);
            assert_eq!(engine.properties()["val"], json!("honest"));
        }
        other => panic!("expected property_update_rejected, got {other:?}"),
    }
    assert_eq!(server.room_storage(&room_id).unwrap()["val"], json!("honest"));
}

#[tokio::test]
async fn test_request_frame_reaches_hook() {
    let hooks = Arc::new(GatedHooks::new());
    let server = SyncServer::new(ServerConfig::default(), hooks.clone());
    let mut peer = Peer::connect(&server);
    peer.register().await;
    peer.send(&ClientFrame::Request {
        request: unison_core::protocol::AppRequest {
            name: "ping".into(),
            data: Some(json!({"n": 1})),
        },
    });
    // Round-trip another frame to order past the async hook dispatch.
    peer.send(&ClientFrame::JoinRoom {
        room_id: "NOROOM".into(),
    });
    peer.recv().await;
    assert_eq!(hooks.requests_seen.load(Ordering::SeqCst), 1);
}

struct PanickyHooks;

#[async_trait]
impl Hooks for PanickyHooks {
    async fn client_registration_requested(
        &self,
        _id: &str,
        _custom_data: Option<&Value>,
    ) -> Decision {
        panic!("hook blew up");
    }
}

#[tokio::test]
async fn test_hook_panic_falls_back_to_default() {
    let server = SyncServer::new(ServerConfig::default(), Arc::new(PanickyHooks));
    let mut peer = Peer::connect(&server);
    // The panic is contained and registration proceeds (default allow).
    let (id, _) = peer.register().await;
    assert_eq!(id.len(), 6);
}

#[tokio::test]
async fn test_room_size_clamped_to_client_cap() {
    let server = server();
    let mut alice = Peer::connect(&server);
    alice.register().await;
    alice.send(&ClientFrame::CreateRoom {
        initial_storage: None,
        size: Some(1000),
    });
    match alice.recv().await {
        ServerFrame::RoomCreated { size, .. } => assert_eq!(size, Some(100)),
        other => panic!("expected room_created, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_grace_expiry_fails() {
    let server = server();
    let mut alice = Peer::connect(&server);
    let (id, token) = alice.register().await;
    drop(alice);

    // Sleep well past the grace window; the pending entry expires.
    tokio::time::sleep(Duration::from_secs(6)).await;

    let mut late = Peer::connect(&server);
    late.send(&ClientFrame::Reconnect {
        id,
        session_token: token,
    });
    match late.recv().await {
        ServerFrame::ReconnectionFailed { reason } => {
            assert_eq!(reason, "Client unknown to server");
        }
        other => panic!("expected reconnection_failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_carries_current_version() {
    let server = server();
    let mut alice = Peer::connect(&server);
    alice.register().await;
    let room_id = alice.create_room(None).await;
    for n in 0..2 {
        server
            .update_room_storage(&room_id, "tick", OpKind::Set, json!(n), None)
            .await
            .unwrap();
    }

    let mut bob = Peer::connect(&server);
    bob.register().await;
    match bob.join_room(&room_id).await {
        ServerFrame::JoinAccepted { version, .. } => assert_eq!(version, 2),
        other => panic!("expected join_accepted, got {other:?}"),
    }
    // The next update continues the fence from the join snapshot.
    server
        .update_room_storage(&room_id, "tick", OpKind::Set, json!(2), None)
        .await
        .unwrap();
    match bob.recv().await {
        ServerFrame::PropertyUpdated { version, .. } => assert_eq!(version, 3),
        other => panic!("expected property_updated, got {other:?}"),
    }
}

#[tokio::test]
async fn test_update_property_before_joining_is_ignored() {
    let server = server();
    let mut alice = Peer::connect(&server);
    alice.register().await;
    alice.send(&ClientFrame::UpdateProperty {
        update: update_for("sneak", json!(1)),
    });
    // The next round trip proves the connection survived and nothing
    // landed anywhere.
    let room_id = alice.create_room(None).await;
    assert!(server.room_storage(&room_id).unwrap().is_empty());
}

struct CapturingHooks {
    captured: Mutex<Option<Value>>,
}

#[async_trait]
impl Hooks for CapturingHooks {
    async fn client_registration_requested(
        &self,
        _id: &str,
        custom_data: Option<&Value>,
    ) -> Decision {
        *self.captured.lock().unwrap() = custom_data.cloned();
        Decision::Allow
    }
}

#[tokio::test]
async fn test_custom_data_reaches_registration_hook() {
    let hooks = Arc::new(CapturingHooks {
        captured: Mutex::new(None),
    });
    let server = SyncServer::new(ServerConfig::default(), hooks.clone());
    let mut peer = Peer::connect(&server);
    peer.send(&ClientFrame::Register {
        id: None,
        custom_data: Some(json!({"nick": "ada", "elo": 1200})),
    });
    assert!(matches!(peer.recv().await, ServerFrame::Registered { .. }));
    assert_eq!(
        hooks.captured.lock().unwrap().clone(),
        Some(json!({"nick": "ada", "elo": 1200}))
    );
}

#[tokio::test]
async fn test_oversize_import_dropped_silently() {
    let server = server();
    let mut alice = Peer::connect(&server);
    alice.register().await;
    let room_id = alice.create_room(None).await;

    // Hand-build an oversize update, bypassing the client-side check.
    let mut engine = CrdtEngine::new();
    let mut update = engine
        .update_property("big", OpKind::Set, json!("small"), None)
        .unwrap();
    *update.operation.data.value_mut() = json!("x".repeat(60_000));
    alice.send(&ClientFrame::UpdateProperty { update });

    // Server drops it: no broadcast, no storage key, no version bump.
    server
        .update_room_storage(&room_id, "probe", OpKind::Set, json!(1), None)
        .await
        .unwrap();
    match alice.recv().await {
        ServerFrame::PropertyUpdated { version, update } => {
            assert_eq!(version, 1);
            assert_eq!(update.key, "probe");
        }
        other => panic!("expected property_updated, got {other:?}"),
    }
    assert!(!server.room_storage(&room_id).unwrap().contains_key("big"));
}
