//! Domain layer public interface.
//!
//! This module defines the transport abstraction the RPC client is built on.
//! It is independent of any concrete socket library.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod transport;

// --- Transport domain re-exports ---

pub use transport::{
    //
    LinkState,
    Transport,
    TransportBase,
    TransportConfig,
    TransportEvent,
    TransportLink,
    TransportPtr,
};
