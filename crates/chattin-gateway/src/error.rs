use std::time::Duration;

use thiserror::Error;

use chattin_types::packet::CodecError;

/// Reasons a session leaves the Authenticating or Active state.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no auth packet within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("invalid token")]
    InvalidToken,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] anyhow::Error),
}
