//! Request/response calls and server-pushed events over one full-duplex link
//!
//! This library provides a client that multiplexes RPC calls and topic
//! subscriptions over a single persistent connection (WebSocket, or an
//! in-process link for tests). It handles call id generation,
//! response correlation, event dispatch and connection-loss handling.
//!

// Import all sub modules once...
mod macros;

mod client;
mod domain;
mod protocol;
mod transport;

mod rpc_config;

mod error;
mod sink;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::{
    //
    EventStream,
    ListenerError,
    ListenerResult,
    RpcClient,
    SubscriptionHandle,
};

pub use rpc_config::{RpcConfig, DEFAULT_INBOX_CAPACITY};

pub use error::{Result, RpcError, ServerError};
pub use sink::{ErrorSink, ErrorSinkPtr, LoggingErrorSink};

pub use protocol::{
    //
    decode,
    encode_notification,
    encode_request,
    CallId,
    CallIdGenerator,
    Envelope,
    Notification,
};

pub use transport::{
    //
    create_memory_transport,
    create_memory_transport_with_hub,
    create_transport,
    create_websocket_transport,
    global_hub,
    MemoryHub,
    MemoryListener,
    MemoryPeer,
};

// --- public re-exports
pub use domain::{
    //
    LinkState,
    Transport,
    TransportBase,
    TransportConfig,
    TransportEvent,
    TransportLink,
    TransportPtr,
};
