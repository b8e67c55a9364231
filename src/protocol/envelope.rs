use serde_json::Value;

use crate::protocol::CallId;
use crate::ServerError;

/// One structured unit exchanged over the link.
///
/// The client produces `Request`s; `Response`s and `Event`s originate at
/// the peer. Every `Response` id refers to a `Request` previously sent on
/// the same connection. `Event`s carry no id and are delivered to zero or
/// more topic listeners. A `Request` decoded from the peer is discarded,
/// since the client serves no calls.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Call: `{ id, method, params }`.
    Request {
        id: CallId,
        method: String,
        params: Value,
    },

    /// Inbound reply to a request: `{ id, ok, result? , error? }`.
    ///
    /// `ok: true` maps to `Ok(result)`, `ok: false` to `Err(error)`.
    Response {
        id: CallId,
        outcome: Result<Value, ServerError>,
    },

    /// Inbound server push: `{ topic, payload }`.
    Event { topic: String, payload: Value },
}

/// Id-less control message telling the peer which topics to push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Subscribe(String),
    Unsubscribe(String),
}

impl Notification {
    pub fn method(&self) -> &'static str {
        match self {
            Notification::Subscribe(_) => "subscribe",
            Notification::Unsubscribe(_) => "unsubscribe",
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            Notification::Subscribe(topic) | Notification::Unsubscribe(topic) => topic,
        }
    }
}
