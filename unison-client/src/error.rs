use thiserror::Error;

use unison_core::error::EngineError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client instance destroyed")]
    Destroyed,

    #[error("not connected")]
    NotConnected,

    #[error("not registered")]
    NotRegistered,

    #[error("not in a room")]
    NotInRoom,

    #[error("already in a room")]
    AlreadyInRoom,

    #[error("request timed out")]
    Timeout,

    #[error("connection lost")]
    ConnectionLost,

    /// The server refused the operation; carries its reason verbatim.
    #[error("{0}")]
    Rejected(String),

    #[error("unexpected server reply")]
    UnexpectedFrame,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
