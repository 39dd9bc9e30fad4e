//! unison-server: room-based realtime synchronization server
//!
//! Features:
//! - Server-authoritative CRDT document per room, broadcast fan-out
//! - Session resumption over a 5 s reconnection grace window
//! - Host migration when a room leader drops
//! - Per-connection rate limiting and transport liveness pings
//!
//! Protocol: binary MessagePack over WebSocket
//!
//! Usage:
//!   cargo run -p unison-server
//!   # Listens on ws://127.0.0.1:8080
//!
//! Environment variables:
//!   UNISON_BIND_ADDR   - Bind address (default: 127.0.0.1:8080)
//!   UNISON_MOUNT_PATH  - Upgrade path (default: /)
//!   UNISON_RATE_LIMIT  - Rate-limit bucket capacity (default: 20)
//!   UNISON_DEBUG       - Set to 1 for debug logging

use std::sync::Arc;

use log::info;
use tokio::net::TcpListener;

use unison_server::hooks::NoHooks;
use unison_server::server::SyncServer;
use unison_server::{ws, ServerConfig};

#[tokio::main]
async fn main() {
    let config = ServerConfig::from_env();
    let default_filter = if config.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    info!(
        "unison-server starting with config: bind={}, mount={}, rate_limit={}",
        config.bind_addr, config.mount_path, config.rate_limit_capacity
    );

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind");

    let server = SyncServer::new(config, Arc::new(NoHooks));
    let serve_task = tokio::spawn(ws::serve(Arc::clone(&server), listener));

    tokio::signal::ctrl_c().await.ok();
    info!("interrupt received, shutting down");
    server.stop().await;
    let _ = serve_task.await;
}
