//! Error types for peerlink-peering.

use peerlink_transport::TransportError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the peer manager and its loops.
#[derive(Debug, Error)]
pub enum PeeringError {
    /// Transport failure while dialing or accepting.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A remote call failed.
    #[error("call failed: {0}")]
    Call(#[from] CallError),

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The peer manager is shut down.
    #[error("peer manager closed")]
    Closed,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed discovery message.
    #[error("discovery protocol error: {0}")]
    Protocol(String),
}

impl PeeringError {
    /// Returns true if the error means the manager can no longer operate.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed | Self::Transport(TransportError::Closed))
    }
}

/// Result type for peering operations.
pub type PeeringResult<T> = Result<T, PeeringError>;

/// Rejection reported by the remote handler.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum RemoteError {
    /// The request or message was rejected as invalid. Never retried.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The remote cannot serve the request right now.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The remote failed while handling the request.
    #[error("internal: {0}")]
    Internal(String),
}

/// Errors returned to callers of remote operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// No answer within the per-call timeout.
    #[error("call timed out")]
    Timeout,

    /// The peer connection is closed.
    #[error("peer connection closed")]
    Closed,

    /// The work queue is full and the caller may not block.
    #[error("unable to enqueue without blocking")]
    WouldBlock,

    /// The remote answered with an error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The remote answered with an unexpected frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl CallError {
    /// Returns true if the remote rejected the payload as invalid.
    #[must_use]
    pub const fn is_invalid(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::Invalid(_)))
    }

    /// Returns true for a per-call timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Maps a sub-stream IO failure. Oversized or corrupt frames are codec
    /// errors; anything else means the stream is gone.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::InvalidData {
            Self::Codec(err.to_string())
        } else {
            Self::Closed
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Errors a [`crate::RequestHandler`] may return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// The request or message is invalid.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The handler cannot serve the request right now.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The handler failed.
    #[error("internal: {0}")]
    Internal(String),
}

impl From<HandlerError> for RemoteError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Invalid(msg) => Self::Invalid(msg),
            HandlerError::Unavailable(msg) => Self::Unavailable(msg),
            HandlerError::Internal(msg) => Self::Internal(msg),
        }
    }
}
