//! unison-client: the client side of the unison synchronization
//! service.
//!
//! Owns a CRDT replica per instance, applies mutations optimistically,
//! tracks the room version fence and resumes sessions across transport
//! drops. See [`client::SyncClient`].

pub mod client;
pub mod connector;
pub mod error;
pub mod events;

pub use client::{ClientConfig, SyncClient};
pub use connector::{Connector, WsConnector};
pub use error::ClientError;
pub use events::ClientEvent;
