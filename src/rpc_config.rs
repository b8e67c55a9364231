//! Public RPC client configuration.
//!
//! This type contains no socket-library concepts. Transport factories read
//! the endpoint URI and inbox capacity from it through [`TransportConfig`].

use std::time::Duration;

use crate::TransportConfig;

/// Default capacity of the transport event inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 64;

/// Client configuration and connection parameters.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// Endpoint URI.
    ///
    /// `ws://` and `wss://` select the WebSocket transport, `memory://<name>`
    /// the in-process transport.
    pub endpoint: String,

    /// Identifier for this client instance, used for logging.
    pub client_id: String,

    /// Time after which an outstanding call is abandoned.
    ///
    /// `None` (the default) means calls stay pending until their response
    /// arrives or the connection drops.
    pub call_timeout: Option<Duration>,

    /// Send `subscribe`/`unsubscribe` notifications so the peer knows which
    /// topics to push.
    ///
    /// Default: `true`
    pub announce_subscriptions: bool,

    /// Capacity of the transport event inbox.
    ///
    /// Default: 64
    pub inbox_capacity: usize,
}

impl RpcConfig {
    /// Create a config for the given endpoint URI.
    pub fn new(endpoint: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_id: client_id.into(),
            call_timeout: None,
            announce_subscriptions: true,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    /// Create a config for the in-process endpoint `memory://<name>`.
    ///
    /// The client id defaults to `name`.
    pub fn memory(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(format!("memory://{name}"), name)
    }

    /// Abandon calls that receive no response within `timeout`.
    ///
    /// # Example
    ///
    /// ```
    /// use duplex_rpc::RpcConfig;
    /// use std::time::Duration;
    ///
    /// let config = RpcConfig::new("ws://localhost:8080/ws", "admin-ui")
    ///     .with_call_timeout(Duration::from_secs(10));
    /// assert_eq!(config.call_timeout, Some(Duration::from_secs(10)));
    /// ```
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Enable or disable subscription announcements.
    pub fn with_announce_subscriptions(mut self, announce: bool) -> Self {
        self.announce_subscriptions = announce;
        self
    }

    /// Set the transport inbox capacity. Values below 1 are raised to 1.
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    /// Transport-level view of this configuration.
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            uri: self.endpoint.clone(),
            transport_id: self.client_id.clone(),
            inbox_capacity: self.inbox_capacity.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn defaults() {
        // ---
        let config = RpcConfig::new("ws://localhost/ws", "ui");
        assert_eq!(config.call_timeout, None);
        assert!(config.announce_subscriptions);
        assert_eq!(config.inbox_capacity, DEFAULT_INBOX_CAPACITY);
    }

    #[test]
    fn memory_endpoint() {
        // ---
        let config = RpcConfig::memory("dash").with_inbox_capacity(0);
        let transport = config.transport_config();

        assert_eq!(transport.uri, "memory://dash");
        assert_eq!(transport.transport_id, "dash");
        assert_eq!(transport.inbox_capacity, 1);
    }
}
