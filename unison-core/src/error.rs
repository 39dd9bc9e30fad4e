use thiserror::Error;

use crate::limits::{MAX_KEYS_PER_ROOM, MAX_VALUE_BYTES};

/// Failures surfaced by the CRDT engine. Both variants leave the engine
/// in its previous consistent state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("value serializes to {size} bytes, limit is {MAX_VALUE_BYTES}")]
    ValueTooLarge { size: usize },

    #[error("storage already holds {MAX_KEYS_PER_ROOM} keys")]
    KeyLimitExceeded,
}
