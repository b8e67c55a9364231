// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! A transport owns exactly one full-duplex connection to one endpoint. It
//! moves opaque frames in both directions and reports lifecycle changes; it
//! knows nothing about calls, identifiers or topics. Correlation and
//! dispatch live in the client layer.
//!
//! Lifecycle signals are delivered on an inbox channel in arrival order:
//!
//! ```text
//! Connecting ──Open──▶ Open ──Closed──▶ Closed
//!      │                 │
//!      └──Error, Closed──┴──Error, Closed──▶ Failed
//! ```
//!
//! A transport never reconnects on its own. Once `Closed` or `Failed`, a new
//! transport is required.
//!
//! Concrete implementations live under `src/transport/`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// The handshake is in progress; sends are rejected.
    Connecting,

    /// Frames flow in both directions.
    Open,

    /// The link was closed, by either side, without an error.
    Closed,

    /// The link failed: the handshake was refused or an I/O error occurred.
    Failed,
}

impl LinkState {
    /// `Closed` and `Failed` are final; no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }
}

/// Lifecycle and data signals emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The handshake completed.
    Open,

    /// One inbound frame.
    Message(Bytes),

    /// The link closed. `code` follows WebSocket close-code conventions
    /// (1000 normal, 1006 abnormal).
    Closed { code: u16, reason: String },

    /// The link hit an error. A `Closed` event always follows.
    Error { cause: String },
}

/// Configuration for creating a transport instance.
///
/// Passed to transport factory functions (`create_*_transport()`).
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Endpoint URI (e.g. `"ws://localhost:8080/ws"`, `"memory://dashboard"`).
    pub uri: String,

    /// Label used in log lines for this transport instance.
    pub transport_id: String,

    /// Capacity of the lifecycle/data inbox.
    pub inbox_capacity: usize,
}

/// Shared base state for all transport implementations.
///
/// Each concrete transport embeds this as a field named `base` so the
/// default `Transport` accessors can delegate to it.
#[derive(Debug, Clone)]
pub struct TransportBase {
    /// Label used in log lines.
    pub transport_id: String,

    /// The endpoint this transport is connected (or connecting) to.
    pub uri: String,
}

impl From<&TransportConfig> for TransportBase {
    fn from(config: &TransportConfig) -> Self {
        // ---
        Self {
            transport_id: config.transport_id.clone(),
            uri: config.uri.clone(),
        }
    }
}

/// Transport abstraction.
///
/// Implementations must ensure that:
/// - `send()` fails with [`RpcError::NotConnected`](crate::RpcError::NotConnected)
///   unless `state()` is [`LinkState::Open`],
/// - inbound frames are emitted on the inbox in the order they were read,
/// - exactly one terminal `Closed` event is emitted per link,
/// - no reconnection is attempted internally.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &TransportBase;

    /// Returns the transport_id of the transport.
    fn transport_id(&self) -> &str {
        &self.base().transport_id
    }

    /// Returns the endpoint URI of the transport.
    fn uri(&self) -> &str {
        &self.base().uri
    }

    /// Current connection state.
    fn state(&self) -> LinkState;

    /// Queue one outbound frame.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Close the link. Closing an already closed link is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// `.clone()` is cheap and every clone drives the same connection.
pub type TransportPtr = Arc<dyn Transport>;

/// A freshly created transport together with the receiving end of its
/// event inbox.
///
/// The inbox is meant to be drained by exactly one consumer; the RPC
/// client takes ownership of it.
pub struct TransportLink {
    // ---
    pub transport: TransportPtr,

    /// Lifecycle and inbound-frame signals, in arrival order.
    pub inbox: mpsc::Receiver<TransportEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        // ---
        assert!(!LinkState::Connecting.is_terminal());
        assert!(!LinkState::Open.is_terminal());
        assert!(LinkState::Closed.is_terminal());
        assert!(LinkState::Failed.is_terminal());
    }
}
