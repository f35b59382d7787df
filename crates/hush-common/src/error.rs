//! Common error types for Hush.

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Result type alias using Hush's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Hush operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Malformed or unknown wire message
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Action not valid in the current state (e.g. chat outside a room)
    #[error("state error: {0}")]
    State(String),

    /// Cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Capture device denied or unavailable
    #[error("media error: {0}")]
    Media(String),

    /// Peer connection or signaling transport failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a state error from any displayable type.
    pub fn state(msg: impl std::fmt::Display) -> Self {
        Self::State(msg.to_string())
    }

    /// Create a crypto error from any displayable type.
    pub fn crypto(msg: impl std::fmt::Display) -> Self {
        Self::Crypto(msg.to_string())
    }

    /// Create a media error from any displayable type.
    pub fn media(msg: impl std::fmt::Display) -> Self {
        Self::Media(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::Transport(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err)
    }
}
