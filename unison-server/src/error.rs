use thiserror::Error;

use unison_core::error::EngineError;

/// Failures surfaced through the host-application interface.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("room {0} not found")]
    RoomNotFound(String),

    #[error("client {0} not found")]
    ClientNotFound(String),

    #[error("client {0} is already in a room")]
    ClientBusy(String),

    #[error("room creation failed: {0}")]
    CreationFailed(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("server is stopped")]
    Stopped,
}
