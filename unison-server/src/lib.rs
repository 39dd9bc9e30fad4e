//! unison-server: the room server.
//!
//! Owns the room registry, session manager, protocol dispatcher,
//! heartbeat and extensibility hooks. Transports attach through
//! [`server::SyncServer::accept`]; the bundled [`ws`] binding serves
//! WebSocket, and `unison_core::transport::memory` provides an
//! in-process transport for embedding and tests.

pub mod config;
pub mod error;
pub mod hooks;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod ws;

pub use config::{Preflight, ServerConfig};
pub use error::ServerError;
pub use hooks::{CreationDecision, Decision, Hooks, NoHooks};
pub use room::{RoomOwner, RoomSummary};
pub use server::SyncServer;
