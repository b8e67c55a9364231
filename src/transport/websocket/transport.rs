//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! This module provides an implementation of the `Transport` trait backed by
//! a single WebSocket connection. It follows an **actor-based concurrency
//! model**:
//!
//! - A single background **actor task** owns the socket, both halves of it.
//! - The actor performs the handshake, writes outbound frames on command,
//!   reads inbound frames and translates socket lifecycle into
//!   [`TransportEvent`]s on the inbox.
//! - All interaction with the socket is serialized through this actor; no
//!   other task ever touches the stream directly.
//!
//! ## Connection behavior
//!
//! Creation is non-blocking. The handshake runs inside the actor; success is
//! reported as `Open`, failure as `Error` followed by `Closed` (1006). There
//! is no reconnection: once the socket ends the actor exits and the
//! transport stays terminal.
//!
//! ## Frames
//!
//! Outbound frames are written as text messages (they are JSON). Inbound
//! text and binary messages are both forwarded as frames; ping/pong and raw
//! frames are handled by tungstenite and not surfaced.
//!
//! ## Scope and limitations
//!
//! - `wss://` endpoints need a TLS feature of `tokio-tungstenite`; without
//!   one the handshake fails and is reported like any other connect error.
//! - The actor does not wait for the peer's close acknowledgement.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    LinkState,
    Result,
    RpcError,
    Transport,
    TransportBase,
    TransportConfig,
    TransportEvent,
    TransportLink,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type SharedState = Arc<Mutex<LinkState>>;

/// Capacity of the actor command queue.
const COMMAND_CAPACITY: usize = 64;

/// Close code reported when the socket ends without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

/// Close code reported when a close frame carries no status.
const CLOSE_NO_STATUS: u16 = 1005;

const CLOSE_NORMAL: u16 = 1000;

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

//
// Actor commands
//

enum Cmd {
    //
    Send {
        frame: Bytes,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Continue,
    Stop,
}

/// WebSocket-based implementation of the `Transport` trait.
struct WebSocketTransport {
    // ---
    base: TransportBase,
    state: SharedState,
    cmd_tx: mpsc::Sender<Cmd>,

    /// Kept so the actor is not detached silently; it exits on its own when
    /// the socket ends or this transport is dropped.
    _actor: JoinHandle<()>,
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    fn state(&self) -> LinkState {
        *lock_ignore_poison(&self.state)
    }

    /// Queue a frame on the socket.
    async fn send(&self, frame: Bytes) -> Result<()> {
        // ---
        if self.state() != LinkState::Open {
            return Err(RpcError::NotConnected);
        }

        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Send { frame, resp })
            .await
            .map_err(|_| RpcError::NotConnected)?;

        rx.await
            .map_err(|_| RpcError::Transport("websocket actor stopped".into()))?
    }

    /// Close the socket. A no-op once the link is terminal.
    async fn close(&self) -> Result<()> {
        // ---
        if self.state().is_terminal() {
            return Ok(());
        }

        let (resp, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close { resp }).await.is_err() {
            // Actor already gone; the link ended on its own.
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

struct WsActor {
    // ---
    transport_id: String, // for logging only
    uri: String,
    state: SharedState,
    cmd_rx: mpsc::Receiver<Cmd>,
    events: mpsc::Sender<TransportEvent>,
}

impl WsActor {
    // ---

    async fn run(mut self) {
        // ---
        let Some(socket) = self.connect().await else {
            return;
        };

        log_info!("{}: connected to {}", self.transport_id, self.uri);
        self.set_state(LinkState::Open);
        self.emit(TransportEvent::Open).await;

        let (mut sink, mut source): (WsSink, WsSource) = socket.split();

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let step = match cmd {
                        Some(cmd) => self.handle_cmd(cmd, &mut sink).await,
                        None => {
                            // Transport dropped without an explicit close.
                            let _ = sink.send(Message::Close(None)).await;
                            self.finish(CLOSE_NORMAL, "transport dropped", None).await;
                            ActorStep::Stop
                        }
                    };
                    if matches!(step, ActorStep::Stop) {
                        break;
                    }
                }

                msg = source.next() => {
                    if matches!(self.handle_incoming(msg).await, ActorStep::Stop) {
                        break;
                    }
                }
            }
        }

        log_debug!("{}: websocket actor stopped", self.transport_id);
    }

    /// Perform the handshake, still honouring commands meanwhile.
    async fn connect(&mut self) -> Option<WsStream> {
        // ---
        let connecting = connect_async(self.uri.clone());
        tokio::pin!(connecting);

        loop {
            tokio::select! {
                res = &mut connecting => {
                    return match res {
                        Ok((socket, _response)) => Some(socket),
                        Err(err) => {
                            let cause = format!("connect to {} failed: {err}", self.uri);
                            log_error!("{}: {cause}", self.transport_id);
                            self.finish(CLOSE_ABNORMAL, "connection failed", Some(cause)).await;
                            None
                        }
                    };
                }

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Cmd::Send { resp, .. }) => {
                        let _ = resp.send(Err(RpcError::NotConnected));
                    }
                    Some(Cmd::Close { resp }) => {
                        self.finish(CLOSE_NORMAL, "closed by client", None).await;
                        let _ = resp.send(Ok(()));
                        return None;
                    }
                    None => return None,
                },
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd, sink: &mut WsSink) -> ActorStep {
        // ---
        match cmd {
            Cmd::Send { frame, resp } => {
                let result = sink.send(to_message(frame)).await.map_err(|err| {
                    log_error!("{}: send failed: {err}", self.transport_id);
                    RpcError::Transport(err.to_string())
                });
                let _ = resp.send(result);
                ActorStep::Continue
            }
            Cmd::Close { resp } => {
                log_debug!("{}: closing websocket", self.transport_id);
                if let Err(_err) = sink.send(Message::Close(None)).await {
                    log_debug!("{}: close frame not sent: {_err}", self.transport_id);
                }
                self.finish(CLOSE_NORMAL, "closed by client", None).await;
                let _ = resp.send(Ok(()));
                ActorStep::Stop
            }
        }
    }

    async fn handle_incoming(
        &mut self,
        msg: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> ActorStep {
        // ---
        match msg {
            Some(Ok(Message::Text(text))) => {
                self.emit(TransportEvent::Message(Bytes::copy_from_slice(text.as_bytes())))
                    .await;
                ActorStep::Continue
            }
            Some(Ok(Message::Binary(data))) => {
                self.emit(TransportEvent::Message(data)).await;
                ActorStep::Continue
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                    None => (CLOSE_NO_STATUS, String::new()),
                };
                log_info!("{}: peer closed ({code}) {reason}", self.transport_id);
                self.finish(code, &reason, None).await;
                ActorStep::Stop
            }
            Some(Ok(_control)) => {
                // Ping/Pong/raw frames are handled by tungstenite.
                ActorStep::Continue
            }
            Some(Err(err)) => {
                log_error!("{}: websocket error: {err}", self.transport_id);
                self.finish(CLOSE_ABNORMAL, "connection failed", Some(err.to_string()))
                    .await;
                ActorStep::Stop
            }
            None => {
                self.finish(CLOSE_ABNORMAL, "stream ended", None).await;
                ActorStep::Stop
            }
        }
    }

    /// Enter the terminal state and emit the closing events, once.
    async fn finish(&mut self, code: u16, reason: &str, cause: Option<String>) {
        // ---
        {
            let mut state = lock_ignore_poison(&self.state);
            if state.is_terminal() {
                return;
            }
            *state = if cause.is_some() {
                LinkState::Failed
            } else {
                LinkState::Closed
            };
        }

        if let Some(cause) = cause {
            self.emit(TransportEvent::Error { cause }).await;
        }
        self.emit(TransportEvent::Closed {
            code,
            reason: reason.to_owned(),
        })
        .await;
    }

    fn set_state(&self, next: LinkState) {
        *lock_ignore_poison(&self.state) = next;
    }

    async fn emit(&self, event: TransportEvent) {
        // ---
        if self.events.send(event).await.is_err() {
            log_debug!("{}: inbox closed, event dropped", self.transport_id);
        }
    }
}

/// JSON frames go out as text; anything not UTF-8 falls back to binary.
fn to_message(frame: Bytes) -> Message {
    // ---
    match String::from_utf8(frame.to_vec()) {
        Ok(text) => Message::text(text),
        Err(_) => Message::Binary(frame),
    }
}

fn validate_uri(uri: &str) -> Result<()> {
    // ---
    if !(uri.starts_with("ws://") || uri.starts_with("wss://")) {
        return Err(RpcError::InvalidConfig(format!(
            "not a websocket endpoint: {uri:?}"
        )));
    }

    uri.into_client_request()
        .map(|_| ())
        .map_err(|err| RpcError::InvalidConfig(format!("bad websocket uri {uri:?}: {err}")))
}

/// Create a WebSocket transport for `config.uri`.
///
/// Returns immediately with the link in `Connecting`; the handshake result
/// is reported on the returned inbox.
///
/// # Errors
///
/// Returns `RpcError::InvalidConfig` if the URI is not a valid `ws://` or
/// `wss://` URI.
pub async fn create_transport(config: &TransportConfig) -> Result<TransportLink> {
    // ---
    validate_uri(&config.uri)?;

    log_debug!("{}: create websocket transport to {}", config.transport_id, config.uri);

    let (events, inbox) = mpsc::channel(config.inbox_capacity.max(1));
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
    let state: SharedState = Arc::new(Mutex::new(LinkState::Connecting));

    let actor = WsActor {
        transport_id: config.transport_id.clone(),
        uri: config.uri.clone(),
        state: state.clone(),
        cmd_rx,
        events,
    };

    let transport = WebSocketTransport {
        base: TransportBase::from(config),
        state,
        cmd_tx,
        _actor: tokio::spawn(actor.run()),
    };

    Ok(TransportLink {
        transport: Arc::new(transport),
        inbox,
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn config(uri: &str) -> TransportConfig {
        TransportConfig {
            uri: uri.to_owned(),
            transport_id: "ws-test".into(),
            inbox_capacity: 16,
        }
    }

    async fn next_event(link: &mut TransportLink) -> TransportEvent {
        timeout(Duration::from_secs(5), link.inbox.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("inbox closed")
    }

    #[tokio::test]
    async fn test_rejects_non_websocket_uri() {
        // ---
        for uri in ["http://localhost/ws", "memory://x", "ws://bad host/ws"] {
            assert!(
                matches!(
                    create_transport(&config(uri)).await,
                    Err(RpcError::InvalidConfig(_))
                ),
                "{uri} accepted"
            );
        }
    }

    #[tokio::test]
    async fn test_refused_connection_fails_link() {
        // ---
        // Bind then drop to get a port nobody listens on.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let mut link = create_transport(&config(&format!("ws://{addr}/ws")))
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
        assert!(matches!(
            link.transport.send(Bytes::from_static(b"{}")).await,
            Err(RpcError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_echo_round_trip_and_peer_close() {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let msg = ws.next().await.unwrap().unwrap();
            ws.send(msg).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let mut link = create_transport(&config(&format!("ws://{addr}/ws")))
            .await
            .unwrap();
        assert_eq!(next_event(&mut link).await, TransportEvent::Open);

        link.transport
            .send(Bytes::from_static(br#"{"topic":"t"}"#))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut link).await,
            TransportEvent::Message(Bytes::from_static(br#"{"topic":"t"}"#))
        );
        assert!(matches!(
            next_event(&mut link).await,
            TransportEvent::Closed { .. }
        ));
        assert_eq!(link.transport.state(), LinkState::Closed);

        server.await.unwrap();
    }
}
