//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, for embedding a
//! peer in the same process, and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the
//! transport layer. Socket-backed transports are expected to approximate it
//! as closely as their underlying library allows:
//!
//! - Creation returns immediately with the link in `Connecting`.
//! - The link opens only when the peer side accepts it, and `Open` is
//!   emitted before any inbound frame.
//! - Frames are delivered in send order, without loss, in both directions.
//! - Every link ends with exactly one `Closed` event, preceded by one
//!   `Error` event when the link failed.
//!
//! ## Topology
//!
//! A [`MemoryHub`] plays the role of the network. A server side binds a name
//! on the hub and accepts connections from a [`MemoryListener`]; each
//! accepted connection is a [`MemoryPeer`], the server's end of one link.
//! Client transports connect to `memory://<name>`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    // ---
    log_debug,
    log_warn,
    LinkState,
    Result,
    RpcError,
    Transport,
    TransportBase,
    TransportConfig,
    TransportEvent,
    TransportLink,
    TransportPtr,
};

/// URI scheme handled by this transport.
pub const MEMORY_SCHEME: &str = "memory://";

/// WebSocket-style close code for an abnormal closure.
const CLOSE_ABNORMAL: u16 = 1006;

/// WebSocket-style close code for a normal closure.
const CLOSE_NORMAL: u16 = 1000;

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process stand-in for the network.
///
/// # Usage in tests
///
/// Construct a hub per test for isolation and pass it to
/// [`create_memory_transport_with_hub`]:
///
/// ```
/// # use duplex_rpc::{MemoryHub, RpcConfig, LinkState};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> duplex_rpc::Result<()> {
/// let hub = MemoryHub::new();
/// let mut listener = hub.bind("dashboard");
///
/// let config = RpcConfig::memory("dashboard").transport_config();
/// let link = duplex_rpc::create_memory_transport_with_hub(&config, hub.clone()).await?;
/// assert_eq!(link.transport.state(), LinkState::Connecting);
///
/// let _peer = listener.accept().await.expect("hub dropped");
/// assert_eq!(link.transport.state(), LinkState::Open);
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<MemoryPeer>>>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Bind `name` and return a listener for connections to
    /// `memory://<name>`.
    ///
    /// Binding a name that is already bound replaces the old listener.
    pub fn bind(&self, name: impl Into<String>) -> MemoryListener {
        // ---
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();

        log_debug!("memory hub: bind {name}");
        lock_ignore_poison(&self.listeners).insert(name.clone(), tx);

        MemoryListener { name, incoming: rx }
    }

    /// Hand a new connection to the listener bound at `name`.
    ///
    /// Gives the peer back if nobody is listening.
    fn connect(&self, name: &str, peer: MemoryPeer) -> std::result::Result<(), MemoryPeer> {
        // ---
        let mut listeners = lock_ignore_poison(&self.listeners);

        let Some(tx) = listeners.get(name) else {
            return Err(peer);
        };

        match tx.send(peer) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(peer)) => {
                // Listener was dropped; forget the stale binding.
                listeners.remove(name);
                Err(peer)
            }
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

/// The hub that `memory://` endpoints resolve against by default.
pub fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// Accepts connections made to one bound name.
pub struct MemoryListener {
    name: String,
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    // ---

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next connection and open it.
    ///
    /// Returns `None` once the hub rebinds the name to another listener.
    /// Connections whose client closed before being accepted are skipped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        // ---
        loop {
            let peer = self.incoming.recv().await?;
            if peer.link.open().await {
                return Some(peer);
            }
            log_debug!("memory listener {}: skipping abandoned connection", self.name);
        }
    }
}

/// State shared by both ends of one in-memory link.
struct LinkShared {
    transport_id: String,
    state: Mutex<LinkState>,
    events: mpsc::Sender<TransportEvent>,
}

impl LinkShared {
    // ---

    fn state(&self) -> LinkState {
        *lock_ignore_poison(&self.state)
    }

    /// Connecting → Open. Returns false if the link already ended.
    async fn open(&self) -> bool {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            if *state != LinkState::Connecting {
                return false;
            }
            *state = LinkState::Open;
        }
        self.emit(TransportEvent::Open).await;
        true
    }

    /// Move to a terminal state, emitting `Error` (if `cause` is set) and
    /// `Closed`. Only the first call has any effect.
    async fn terminate(&self, code: u16, reason: &str, cause: Option<String>) -> bool {
        // ---
        if !self.mark_terminal(cause.is_some()) {
            return false;
        }

        if let Some(cause) = cause {
            self.emit(TransportEvent::Error { cause }).await;
        }
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.to_owned(),
        })
        .await;
        true
    }

    /// Non-async variant of [`terminate`](Self::terminate) used from `Drop`.
    ///
    /// The state changes at once. `Closed` is delivered from a task on the
    /// current runtime, waiting for inbox space like any other event; only
    /// without a runtime is it offered once and possibly lost.
    fn terminate_detached(self: &Arc<Self>, code: u16, reason: &str) {
        // ---
        if !self.mark_terminal(false) {
            return;
        }

        let closed = TransportEvent::Closed {
            code,
            reason: reason.to_owned(),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let link = Arc::clone(self);
                runtime.spawn(async move { link.emit(closed).await });
            }
            Err(_) => {
                if self.events.try_send(closed).is_err() {
                    log_warn!("{}: no runtime and inbox full, close event dropped", self.transport_id);
                }
            }
        }
    }

    fn mark_terminal(&self, failed: bool) -> bool {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.is_terminal() {
            return false;
        }
        *state = if failed {
            LinkState::Failed
        } else {
            LinkState::Closed
        };
        true
    }

    async fn emit(&self, event: TransportEvent) {
        // ---
        if self.events.send(event).await.is_err() {
            log_debug!("{}: inbox closed, event dropped", self.transport_id);
        }
    }
}

/// The server end of one in-memory link.
///
/// Frames the client sends arrive here; frames sent from here reach the
/// client's inbox. Dropping an open peer closes the link abnormally (1006).
pub struct MemoryPeer {
    link: Arc<LinkShared>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryPeer {
    // ---

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    /// Next frame sent by the client, or `None` once the client closed.
    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    /// Next client frame parsed as JSON.
    ///
    /// A frame that is not valid JSON is logged and yielded as
    /// `Value::Null`.
    pub async fn recv_json(&mut self) -> Option<Value> {
        // ---
        let frame = self.recv_frame().await?;
        match serde_json::from_slice(&frame) {
            Ok(value) => Some(value),
            Err(_err) => {
                log_warn!("{}: peer received non-JSON frame: {_err}", self.link.transport_id);
                Some(Value::Null)
            }
        }
    }

    /// Push one frame to the client.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NotConnected` unless the link is open.
    pub async fn send_frame(&self, frame: impl Into<Bytes>) -> Result<()> {
        // ---
        if self.state() != LinkState::Open {
            return Err(RpcError::NotConnected);
        }
        self.link.emit(TransportEvent::Message(frame.into())).await;
        Ok(())
    }

    /// Push one JSON value to the client.
    pub async fn send_json(&self, value: &Value) -> Result<()> {
        // ---
        let bytes = serde_json::to_vec(value)?;
        self.send_frame(bytes).await
    }

    /// Close the link from the server side.
    pub async fn close(&self, code: u16, reason: &str) {
        self.link.terminate(code, reason, None).await;
    }

    /// Fail the link from the server side, as an I/O error would.
    pub async fn fail(&self, cause: impl Into<String>) {
        self.link
            .terminate(CLOSE_ABNORMAL, "connection failed", Some(cause.into()))
            .await;
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        // ---
        if self.link.state() == LinkState::Open {
            self.link.terminate_detached(CLOSE_ABNORMAL, "peer dropped");
        }
    }
}

/// In-memory transport: the client end of one link.
struct MemoryTransport {
    // ---
    base: TransportBase,
    link: Arc<LinkShared>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn state(&self) -> LinkState {
        self.link.state()
    }

    /// Queue a frame for the peer.
    async fn send(&self, frame: Bytes) -> Result<()> {
        // ---
        if self.state() != LinkState::Open {
            return Err(RpcError::NotConnected);
        }

        let outbound = lock_ignore_poison(&self.outbound);
        let tx = outbound.as_ref().ok_or(RpcError::NotConnected)?;
        tx.send(frame)
            .map_err(|_| RpcError::Transport("memory peer is gone".into()))
    }

    /// Close the link.
    ///
    /// The peer observes end-of-stream on `recv_frame()`.
    async fn close(&self) -> Result<()> {
        // ---
        lock_ignore_poison(&self.outbound).take();

        if self
            .link
            .terminate(CLOSE_NORMAL, "closed by client", None)
            .await
        {
            log_debug!("{}: closing transport...", self.transport_id());
        }
        Ok(())
    }
}

/// Create a new in-memory transport on the process-global hub.
///
/// # Errors
///
/// Returns `RpcError::InvalidConfig` if the URI is not a `memory://` URI.
pub async fn create_memory_transport(config: &TransportConfig) -> Result<TransportLink> {
    // ---
    create_memory_transport_with_hub(config, global_hub()).await
}

/// Create a new in-memory transport on the provided hub.
///
/// The link starts in `Connecting`. It opens when a listener bound at the
/// URI's name accepts it; if nothing is bound there the link fails with
/// `Error` followed by `Closed` (1006), reported on the returned inbox.
///
/// # Errors
///
/// Returns `RpcError::InvalidConfig` if the URI is not a `memory://` URI.
pub async fn create_memory_transport_with_hub(
    config: &TransportConfig,
    hub: Arc<MemoryHub>,
) -> Result<TransportLink> {
    // ---
    let name = config
        .uri
        .strip_prefix(MEMORY_SCHEME)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            RpcError::InvalidConfig(format!("not a memory endpoint: {:?}", config.uri))
        })?
        .to_owned();

    log_debug!("{}: create memory transport to {name}", config.transport_id);

    let (events_tx, inbox) = mpsc::channel(config.inbox_capacity.max(1));
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let link = Arc::new(LinkShared {
        transport_id: config.transport_id.clone(),
        state: Mutex::new(LinkState::Connecting),
        events: events_tx,
    });

    let peer = MemoryPeer {
        link: link.clone(),
        outbound: outbound_rx,
    };

    if let Err(peer) = hub.connect(&name, peer) {
        // Report the refusal asynchronously, the way a socket handshake
        // failure would surface.
        let link = peer.link.clone();
        drop(peer);
        tokio::spawn(async move {
            link.terminate(
                CLOSE_ABNORMAL,
                "connection refused",
                Some(format!("no listener bound at {MEMORY_SCHEME}{name}")),
            )
            .await;
        });
    }

    let transport = MemoryTransport {
        base: TransportBase::from(config),
        link,
        outbound: Mutex::new(Some(outbound_tx)),
    };

    Ok(TransportLink {
        transport: Arc::new(transport) as TransportPtr,
        inbox,
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn config(name: &str) -> TransportConfig {
        TransportConfig {
            uri: format!("memory://{name}"),
            transport_id: format!("test-{name}"),
            inbox_capacity: 16,
        }
    }

    async fn next_event(link: &mut TransportLink) -> TransportEvent {
        timeout(Duration::from_secs(1), link.inbox.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("inbox closed")
    }

    #[tokio::test]
    async fn test_accept_opens_link_and_frames_flow() {
        // ---
        let hub = MemoryHub::new();
        let mut listener = hub.bind("svc");
        let mut link = create_memory_transport_with_hub(&config("svc"), hub.clone())
            .await
            .unwrap();

        assert_eq!(link.transport.state(), LinkState::Connecting);
        assert!(matches!(
            link.transport.send(Bytes::from_static(b"early")).await,
            Err(RpcError::NotConnected)
        ));

        let mut peer = listener.accept().await.unwrap();
        assert_eq!(next_event(&mut link).await, TransportEvent::Open);

        link.transport.send(Bytes::from_static(b"up")).await.unwrap();
        assert_eq!(peer.recv_frame().await.unwrap(), Bytes::from_static(b"up"));

        peer.send_frame(Bytes::from_static(b"down")).await.unwrap();
        assert_eq!(
            next_event(&mut link).await,
            TransportEvent::Message(Bytes::from_static(b"down"))
        );
    }

    #[tokio::test]
    async fn test_unbound_name_fails() {
        // ---
        let hub = MemoryHub::new();
        let mut link = create_memory_transport_with_hub(&config("nobody"), hub)
            .await
            .unwrap();

        assert!(matches!(
            next_event(&mut link).await,
            TransportEvent::Error { .. }
        ));
        assert!(matches!(
            next_event(&mut link).await,
            TransportEvent::Closed { code: 1006, .. }
        ));
        assert_eq!(link.transport.state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn test_peer_close_and_drop() {
        // ---
        let hub = MemoryHub::new();
        let mut listener = hub.bind("svc");

        let mut first = create_memory_transport_with_hub(&config("svc"), hub.clone())
            .await
            .unwrap();
        let peer = listener.accept().await.unwrap();
        next_event(&mut first).await;

        peer.close(1000, "bye").await;
        assert_eq!(
            next_event(&mut first).await,
            TransportEvent::Closed {
                code: 1000,
                reason: "bye".into()
            }
        );
        assert_eq!(first.transport.state(), LinkState::Closed);

        let mut second = create_memory_transport_with_hub(&config("svc"), hub.clone())
            .await
            .unwrap();
        let peer = listener.accept().await.unwrap();
        next_event(&mut second).await;

        drop(peer);
        assert!(matches!(
            next_event(&mut second).await,
            TransportEvent::Closed { code: 1006, .. }
        ));
    }

    #[tokio::test]
    async fn test_peer_drop_with_full_inbox_still_closes() {
        // ---
        let hub = MemoryHub::new();
        let mut listener = hub.bind("svc");
        let config = TransportConfig {
            inbox_capacity: 1,
            ..config("svc")
        };

        let mut link = create_memory_transport_with_hub(&config, hub.clone())
            .await
            .unwrap();
        let peer = listener.accept().await.unwrap();

        // `Open` occupies the only inbox slot while the peer goes away.
        drop(peer);
        assert_eq!(link.transport.state(), LinkState::Closed);

        assert_eq!(next_event(&mut link).await, TransportEvent::Open);
        assert!(matches!(
            next_event(&mut link).await,
            TransportEvent::Closed { code: 1006, .. }
        ));
    }

    #[tokio::test]
    async fn test_client_close_ends_peer_stream() {
        // ---
        let hub = MemoryHub::new();
        let mut listener = hub.bind("svc");
        let mut link = create_memory_transport_with_hub(&config("svc"), hub.clone())
            .await
            .unwrap();
        let mut peer = listener.accept().await.unwrap();
        next_event(&mut link).await;

        link.transport.close().await.unwrap();
        link.transport.close().await.unwrap();

        assert!(peer.recv_frame().await.is_none());
        assert!(matches!(
            next_event(&mut link).await,
            TransportEvent::Closed { code: 1000, .. }
        ));
        assert!(matches!(
            peer.send_frame(Bytes::from_static(b"late")).await,
            Err(RpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_rejects_foreign_scheme() {
        // ---
        let mut cfg = config("svc");
        cfg.uri = "ws://localhost/ws".into();
        assert!(matches!(
            create_memory_transport_with_hub(&cfg, MemoryHub::new()).await,
            Err(RpcError::InvalidConfig(_))
        ));
    }
}
