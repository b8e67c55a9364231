//! Wire protocol for the RPC link.
//!
//! This module defines the envelope shapes exchanged over the socket and the
//! call identifiers used to correlate responses with outstanding requests.
//! Everything here is pure: no I/O, no shared state.
mod codec;
mod correlation;
mod envelope;

pub use codec::{decode, encode_notification, encode_request};
pub use correlation::{CallId, CallIdGenerator};
pub use envelope::{Envelope, Notification};
