//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait and the factory that picks one from an endpoint URI.
//! Transports are exposed only through constructor functions; domain code
//! must not depend on transport-specific types.

mod memory;
mod websocket;

pub use memory::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    global_hub,
    MemoryHub,
    MemoryListener,
    MemoryPeer,
    MEMORY_SCHEME,
};

pub use websocket::create_transport as create_websocket_transport;

use crate::{log_debug, Result, RpcError, TransportConfig, TransportLink};

/// Create the transport selected by the scheme of `config.uri`.
///
/// - `memory://<name>` connects to a listener on the process-global
///   [`MemoryHub`].
/// - `ws://` and `wss://` open a WebSocket.
///
/// The returned link starts in `Connecting`; the outcome of the handshake
/// arrives on its inbox.
///
/// # Errors
///
/// Returns `RpcError::InvalidConfig` for any other scheme or a malformed
/// URI.
pub async fn create_transport(config: &TransportConfig) -> Result<TransportLink> {
    // ---
    let uri = config.uri.as_str();
    log_debug!("{}: selecting transport for {uri}", config.transport_id);

    if uri.starts_with(MEMORY_SCHEME) {
        create_memory_transport(config).await
    } else if uri.starts_with("ws://") || uri.starts_with("wss://") {
        create_websocket_transport(config).await
    } else {
        Err(RpcError::InvalidConfig(format!(
            "unsupported endpoint scheme: {uri:?}"
        )))
    }
}
