//! Error types for muxrpc.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for all muxrpc operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (malformed frame, bad request envelope, etc.).
    /// Fatal to the session.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Write on a stream whose outbound side is already closed.
    #[error("stream closed")]
    StreamClosed,

    /// Operation not permitted by the stream's declared capability.
    #[error("stream capability violation: {0}")]
    CapabilityViolation(&'static str),

    /// The RPC session has been terminated.
    #[error("session terminated")]
    SessionTerminated,

    /// The request was cancelled, locally or by the peer.
    #[error("request cancelled")]
    Cancelled,

    /// The remote side failed the call.
    #[error("remote call failed: {0}")]
    Remote(#[from] CallError),

    /// The stream ended before the expected reply arrived.
    #[error("unexpected end of stream")]
    UnexpectedEnd,
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Wire shape of a failed call.
///
/// Transmitted as the JSON body of an end/err frame and surfaced to the
/// reader waiting on the affected stream. The field set is fixed by the
/// protocol; `stack` may be empty but is always present on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{name}: {message}")]
pub struct CallError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: String,
}

impl CallError {
    /// Create a call error with an empty stack.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: String::new(),
        }
    }
}
