// src/transport/websocket/mod.rs

//! WebSocket transport implementation.
//!
//! One transport instance owns one WebSocket connection, driven by a
//! background actor task. See [`transport`] for the concurrency model.

mod transport;

pub use transport::create_transport;
