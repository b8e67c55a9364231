use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::CallId;

/// Errors that can occur on the client side of an RPC link.
///
/// Per-call failures (`Server`, `Timeout`, `Serialization`) reach only the
/// caller that issued the call. Connection-wide failures (`ConnectionLost`)
/// reach every pending caller and the shared [`ErrorSink`](crate::ErrorSink).
#[derive(Error, Debug)]
pub enum RpcError {
    /// A call or send was attempted while the link was not open.
    #[error("not connected")]
    NotConnected,

    /// An inbound frame could not be classified as a response or an event.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The peer answered the call with `ok: false`.
    #[error("server error: {0}")]
    Server(ServerError),

    /// The link closed or failed while the call was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// A call identifier was registered twice while still pending.
    #[error("duplicate call id: {0}")]
    DuplicateId(CallId),

    /// The call was abandoned after the configured call timeout.
    #[error("call timed out")]
    Timeout,

    /// Parameters could not be encoded or a result could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The underlying transport reported a failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration was rejected before any connection attempt.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A subscription listener failed while handling an event.
    #[error("listener for topic {topic:?} failed: {message}")]
    Listener { topic: String, message: String },
}

/// Structured error body carried by a failed response.
///
/// `message` is always present; any other fields the peer sent are kept in
/// `data` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    pub message: String,

    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ServerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: Map::new(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Result type alias for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn server_error_keeps_extra_fields() {
        // ---
        let err: ServerError =
            serde_json::from_value(json!({"message": "nope", "code": 42})).unwrap();

        assert_eq!(err.message, "nope");
        assert_eq!(err.data.get("code"), Some(&json!(42)));
        assert_eq!(RpcError::Server(err).to_string(), "server error: nope");
    }
}
