//! Client side of the RPC link.
//!
//! [`RpcClient`] is the orchestrator; the pending-call table and the
//! subscription registry are its internal building blocks.

mod pending;
mod rpc_client;
mod stream;
mod subscriptions;

pub use rpc_client::RpcClient;
pub use stream::EventStream;
pub use subscriptions::{ListenerError, ListenerResult, SubscriptionHandle};
