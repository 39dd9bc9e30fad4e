//! unison-core: the transport-independent heart of the unison
//! synchronization service.
//!
//! Contains the per-room replicated document (a custom operation-log
//! CRDT with vector clocks and log compaction), value sanitization, the
//! binary wire protocol, id/token minting, and the channel-based
//! transport seam shared by server and client.

pub mod clock;
pub mod engine;
pub mod error;
pub mod id;
pub mod limits;
pub mod op;
pub mod protocol;
pub mod transport;
pub mod value;

pub use clock::{ReplicaId, VectorClock};
pub use engine::{CrdtEngine, EngineConfig};
pub use error::EngineError;
pub use op::{causal_cmp, OpData, OpKind, Operation};
pub use protocol::{
    AppRequest, ClientFrame, ClientId, Host, PropertyUpdate, RoomData, RoomId, ServerFrame,
    StateSnapshot,
};
