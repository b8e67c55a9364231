// src/client/rpc_client.rs
//! RPC client implementation.
//!
//! This module contains the core [`RpcClient`] type which multiplexes
//! request/response calls and server-pushed events over one transport link.
//!
//! # Architecture
//!
//! The client owns the receiving end of the transport inbox and runs a
//! background receive loop over it. Each lifecycle signal and inbound frame
//! is handled in arrival order:
//!
//! - `Open` moves the client to [`LinkState::Open`] and announces every
//!   registered topic to the peer.
//! - A response frame settles the matching entry in the pending-call table.
//! - An event frame is dispatched to the topic's listeners.
//! - A malformed frame is logged and discarded; the session continues.
//! - `Error` / `Closed` end the session: every pending call is rejected
//!   with [`RpcError::ConnectionLost`] and the error sink is told once.
//!   Subscriptions survive.
//!
//! Each call takes the next id from a monotonic counter and registers a
//! oneshot channel in the pending table before the request is sent.
//!
//! # Concurrency
//!
//! Multiple calls can be in flight at once. The pending table and the
//! subscription registry are protected by mutexes that are only held for
//! map operations; listeners run without any lock held.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;

use super::pending::PendingCalls;
use super::stream::EventStream;
use super::subscriptions::{ListenerResult, SubscriptionHandle, SubscriptionRegistry};
use crate::protocol::{decode, encode_notification, encode_request, CallIdGenerator};
use crate::sink::{report_to, ErrorSinkPtr};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    Envelope,
    LinkState,
    Notification,
    Result,
    RpcConfig,
    RpcError,
    TransportEvent,
    TransportLink,
    TransportPtr,
};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is a pending-call map or a listener registry; neither
/// holds invariants spanning multiple fields, so a panic elsewhere cannot
/// leave them half-updated in a way that matters here.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed). Every clone drives the same
/// connection; the application root owns it and hands clones to whatever
/// needs to issue calls or subscribe.
#[derive(Clone)]
pub struct RpcClient {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    // ---
    transport: TransportPtr,
    config: RpcConfig,
    sink: ErrorSinkPtr,

    state: watch::Sender<LinkState>,
    ids: CallIdGenerator,
    pending: Mutex<PendingCalls>,
    subscriptions: Mutex<SubscriptionRegistry>,

    /// Set once `close()` has torn the client down.
    shut_down: AtomicBool,

    /// Receive loop handle, taken and aborted on close.
    rx_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // ---
        if let Some(task) = lock_ignore_poison(&self.rx_task).take() {
            task.abort();
        }
    }
}

impl RpcClient {
    // ---
    /// Create a client over an explicitly provided transport link.
    ///
    /// This is the constructor you want for tests and for custom transports.
    /// The client takes over the link's inbox and starts its receive loop
    /// immediately, so it must be called from within a Tokio runtime.
    pub fn with_transport(link: TransportLink, config: RpcConfig, sink: ErrorSinkPtr) -> Self {
        // ---
        let TransportLink { transport, inbox } = link;

        log_debug!(
            "{}: starting client on {}",
            config.client_id,
            transport.uri()
        );

        let inner = Arc::new(Inner {
            transport,
            config,
            sink,
            state: watch::Sender::new(LinkState::Connecting),
            ids: CallIdGenerator::new(),
            pending: Mutex::new(PendingCalls::new()),
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            shut_down: AtomicBool::new(false),
            rx_task: Mutex::new(None),
        });

        // The loop only holds a weak reference, so dropping every clone of
        // the client ends it.
        let rx_task = tokio::spawn(receive_loop(Arc::downgrade(&inner), inbox));
        *lock_ignore_poison(&inner.rx_task) = Some(rx_task);

        Self { inner }
    }

    /// Convenience constructor that creates the transport for
    /// `config.endpoint` and starts a client on it.
    ///
    /// Returns as soon as the transport exists; use
    /// [`wait_open`](Self::wait_open) to wait for the handshake.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::InvalidConfig` if the endpoint URI is not supported
    /// by any transport.
    pub async fn connect(config: &RpcConfig, sink: ErrorSinkPtr) -> Result<Self> {
        // ---
        let link = crate::create_transport(&config.transport_config()).await?;
        Ok(Self::with_transport(link, config.clone(), sink))
    }

    /// Current connection state as seen by the client.
    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    /// Wait until the connection leaves `Connecting`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ConnectionLost` if the connection closed or failed
    /// instead of opening.
    pub async fn wait_open(&self) -> Result<()> {
        // ---
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|state| *state != LinkState::Connecting)
            .await
            .map_err(|_| RpcError::ConnectionLost)?;

        match *state {
            LinkState::Open => Ok(()),
            _ => Err(RpcError::ConnectionLost),
        }
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        lock_ignore_poison(&self.inner.pending).len()
    }

    /// Number of registered listeners across all topics.
    pub fn subscription_count(&self) -> usize {
        lock_ignore_poison(&self.inner.subscriptions).len()
    }

    /// Name used to tag this client's log lines.
    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    /// Call `method` on the server and decode its result.
    ///
    /// The call waits until the response arrives or the connection drops.
    /// If [`RpcConfig::call_timeout`] is set, it is abandoned after that
    /// long instead.
    ///
    /// # Errors
    ///
    /// - `RpcError::NotConnected` if the connection is not open; nothing is
    ///   sent.
    /// - `RpcError::Server` if the server answered with `ok: false`.
    /// - `RpcError::ConnectionLost` if the connection ended first.
    /// - `RpcError::Timeout` if the configured timeout expired.
    /// - `RpcError::Serialization` if `params` cannot be encoded or the
    ///   result does not decode as `R`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use duplex_rpc::{LoggingErrorSink, RpcClient, RpcConfig};
    /// # use serde::{Deserialize, Serialize};
    /// # use std::sync::Arc;
    /// #[derive(Serialize)]
    /// struct Echo<'a> { message: &'a str }
    /// #[derive(Deserialize)]
    /// struct Reply { message: String }
    /// # async fn example() -> duplex_rpc::Result<()> {
    /// let config = RpcConfig::new("ws://localhost:8080/ws", "admin-ui");
    /// let client = RpcClient::connect(&config, Arc::new(LoggingErrorSink)).await?;
    /// client.wait_open().await?;
    ///
    /// let reply: Reply = client.call("echo", &Echo { message: "hi" }).await?;
    /// assert_eq!(reply.message, "hi");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call<P, R>(&self, method: &str, params: &P) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        // ---
        let value = self
            .invoke(method, params, self.inner.config.call_timeout)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Like [`call`](Self::call), returning the raw result value.
    pub async fn call_value<P>(&self, method: &str, params: &P) -> Result<Value>
    where
        P: Serialize + ?Sized,
    {
        self.invoke(method, params, self.inner.config.call_timeout)
            .await
    }

    /// Like [`call`](Self::call), abandoning the call after `timeout`.
    ///
    /// On expiry the pending entry is removed and a late response for it is
    /// ignored.
    ///
    /// # Errors
    ///
    /// As for [`call`](Self::call); `RpcError::Timeout` on expiry.
    pub async fn call_with_timeout<P, R>(
        &self,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        // ---
        let value = self.invoke(method, params, Some(timeout)).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn invoke<P>(&self, method: &str, params: &P, timeout: Option<Duration>) -> Result<Value>
    where
        P: Serialize + ?Sized,
    {
        // ---
        if self.state() != LinkState::Open {
            return Err(RpcError::NotConnected);
        }

        let id = self.inner.ids.next_id();
        let frame = encode_request(id, method, params)?;

        let rx = {
            let mut pending = lock_ignore_poison(&self.inner.pending);

            // Checked again under the table lock: a drain that already ran
            // would never see an entry registered after it.
            if self.state() != LinkState::Open {
                return Err(RpcError::NotConnected);
            }
            pending.register(id)?
        };

        log_debug!("{}: call {id} {method}", self.client_id());

        // The timeout covers the send too: a transport applying
        // back-pressure must not hold the caller past its limit.
        let exchange = async {
            if let Err(err) = self.inner.transport.send(frame).await {
                lock_ignore_poison(&self.inner.pending).remove(id);
                return Err(err);
            }

            // A closed channel means the entry was dropped without
            // settlement, which only happens when the client is torn down.
            rx.await.map_err(|_| RpcError::ConnectionLost)?
        };

        match timeout {
            None => exchange.await,
            Some(limit) => match time::timeout(limit, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    lock_ignore_poison(&self.inner.pending).remove(id);
                    log_debug!("{}: call {id} {method} timed out", self.client_id());
                    Err(RpcError::Timeout)
                }
            },
        }
    }

    /// Register `listener` for events on `topic`.
    ///
    /// Listeners on one topic run in registration order, synchronously in
    /// the receive loop; keep them short. A listener returning `Err` or
    /// panicking is reported to the error sink and does not affect the
    /// others.
    ///
    /// Works in any connection state. When this is the first listener on
    /// the topic and the connection is open, the peer is sent a `subscribe`
    /// notification.
    pub async fn subscribe<F>(&self, topic: &str, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Value) -> ListenerResult + Send + Sync + 'static,
    {
        // ---
        let (handle, first) =
            lock_ignore_poison(&self.inner.subscriptions).subscribe(topic, Arc::new(listener));

        log_debug!("{}: subscribed to {topic:?}", self.client_id());

        if first {
            self.announce(Notification::Subscribe(topic.to_owned()))
                .await;
        }
        handle
    }

    /// Subscribe to `topic` as a stream of payloads.
    ///
    /// Payloads are buffered without bound until read. Dropping the stream
    /// removes its listener.
    pub async fn subscribe_stream(&self, topic: &str) -> EventStream {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = self
            .subscribe(topic, move |payload: &Value| -> ListenerResult {
                // The stream may be gone already; its listener is removed
                // right after.
                let _ = tx.send(payload.clone());
                Ok(())
            })
            .await;

        EventStream::new(rx, handle, Arc::downgrade(&self.inner))
    }

    /// Remove the listener behind `handle`.
    ///
    /// Returns false if it was not registered. Removing the last listener
    /// of a topic while open sends the peer an `unsubscribe` notification.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        // ---
        let removed = lock_ignore_poison(&self.inner.subscriptions).unsubscribe(handle);

        match removed {
            None => false,
            Some(now_empty) => {
                if now_empty {
                    self.announce(Notification::Unsubscribe(handle.topic().to_owned()))
                        .await;
                }
                true
            }
        }
    }

    /// Registry removal only; the caller decides about the announcement.
    pub(crate) fn remove_listener(&self, handle: &SubscriptionHandle) -> Option<bool> {
        lock_ignore_poison(&self.inner.subscriptions).unsubscribe(handle)
    }

    /// Tear the client down.
    ///
    /// Closes the transport, rejects every pending call with
    /// `RpcError::ConnectionLost`, removes all listeners and stops the
    /// receive loop. The error sink is not told. Calling it again is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if closing it failed; the client is
    /// torn down regardless.
    pub async fn close(&self) -> Result<()> {
        // ---
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        log_info!("{}: closing client", self.client_id());

        // Terminal before the transport reports anything, so the receive
        // loop treats the coming `Closed` as already handled.
        self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = LinkState::Closed;
                true
            }
        });

        let result = self.inner.transport.close().await;

        let _drained = lock_ignore_poison(&self.inner.pending).drain_all(|| RpcError::ConnectionLost);
        let _topics = lock_ignore_poison(&self.inner.subscriptions).clear();

        log_debug!(
            "{}: teardown rejected {_drained} call(s), dropped listeners on {} topic(s)",
            self.client_id(),
            _topics.len()
        );

        if let Some(task) = lock_ignore_poison(&self.inner.rx_task).take() {
            task.abort();
        }

        result
    }

    /// Send a subscription notification if enabled and open.
    pub(crate) async fn announce(&self, notice: Notification) {
        // ---
        if !self.inner.config.announce_subscriptions || self.state() != LinkState::Open {
            return;
        }

        let frame = match encode_notification(&notice) {
            Ok(frame) => frame,
            Err(_err) => {
                log_warn!("{}: cannot encode {}: {_err}", self.client_id(), notice.method());
                return;
            }
        };

        if let Err(_err) = self.inner.transport.send(frame).await {
            log_warn!(
                "{}: {} {:?} not sent: {_err}",
                self.client_id(),
                notice.method(),
                notice.topic()
            );
        }
    }

    //
    // Receive loop handlers
    //

    // Never awaits the transport: a send can wait on the actor, and the
    // actor can wait on this loop to drain the inbox.
    fn handle_event(&self, event: TransportEvent) -> LoopStep {
        // ---
        match event {
            TransportEvent::Open => {
                let opened = self.inner.state.send_if_modified(|state| {
                    if *state == LinkState::Connecting {
                        *state = LinkState::Open;
                        true
                    } else {
                        false
                    }
                });

                if opened {
                    log_info!("{}: connected to {}", self.client_id(), self.inner.transport.uri());
                    let client = self.clone();
                    tokio::spawn(async move { client.announce_all().await });
                }
                LoopStep::Continue
            }

            TransportEvent::Message(frame) => {
                self.handle_frame(&frame);
                LoopStep::Continue
            }

            TransportEvent::Error { cause } => {
                self.connection_lost(LinkState::Failed, &cause);
                LoopStep::Continue
            }

            TransportEvent::Closed { code, reason } => {
                self.connection_lost(LinkState::Closed, &format!("closed ({code}) {reason}"));
                LoopStep::Stop
            }
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        // ---
        match decode(frame) {
            Ok(Envelope::Response { id, outcome }) => {
                let mut pending = lock_ignore_poison(&self.inner.pending);
                let settled = match outcome {
                    Ok(value) => pending.resolve(id, value),
                    Err(err) => pending.reject(id, RpcError::Server(err)),
                };
                drop(pending);

                if !settled {
                    log_debug!(
                        "{}: response for unknown or abandoned call {id} ignored",
                        self.client_id()
                    );
                }
            }

            Ok(Envelope::Event { topic, payload }) => {
                let dispatch = lock_ignore_poison(&self.inner.subscriptions).snapshot(&topic);
                if dispatch.is_empty() {
                    log_debug!("{}: no listener for topic {topic:?}", self.client_id());
                    return;
                }
                dispatch.run(&payload, self.inner.sink.as_ref());
            }

            Ok(Envelope::Request { id, method, .. }) => {
                log_warn!(
                    "{}: peer request {id} {method:?} discarded, client serves no calls",
                    self.client_id()
                );
            }

            Err(_err) => {
                log_warn!("{}: discarding frame: {_err}", self.client_id());
            }
        }
    }

    /// Move to `next` (Closed or Failed) once, draining pending calls.
    fn connection_lost(&self, next: LinkState, _detail: &str) {
        // ---
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        });
        if !changed {
            return;
        }

        let drained = lock_ignore_poison(&self.inner.pending).drain_all(|| RpcError::ConnectionLost);

        log_warn!(
            "{}: connection lost: {_detail}; {drained} pending call(s) rejected",
            self.client_id()
        );

        report_to(self.inner.sink.as_ref(), &RpcError::ConnectionLost);
    }

    async fn announce_all(&self) {
        // ---
        if !self.inner.config.announce_subscriptions {
            return;
        }

        let mut topics = lock_ignore_poison(&self.inner.subscriptions).topics();
        topics.sort();

        for topic in topics {
            self.announce(Notification::Subscribe(topic)).await;
        }
    }
}

enum LoopStep {
    //
    Continue,
    Stop,
}

async fn receive_loop(weak: std::sync::Weak<Inner>, mut inbox: mpsc::Receiver<TransportEvent>) {
    // ---
    while let Some(event) = inbox.recv().await {
        let Some(inner) = weak.upgrade() else {
            // Client dropped, nobody left to deliver to.
            break;
        };

        let client = RpcClient { inner };
        if matches!(client.handle_event(event), LoopStep::Stop) {
            break;
        }
    }

    log_debug!("client receive loop stopped");
}
