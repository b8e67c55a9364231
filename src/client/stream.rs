//! Pull-based view of one topic's events.

use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::rpc_client::{Inner, RpcClient};
use super::subscriptions::SubscriptionHandle;
use crate::{log_debug, Notification};

/// Stream of payloads published on one topic.
///
/// Created by [`RpcClient::subscribe_stream`]. Payloads arrive in the order
/// the peer pushed them and are buffered until read. Dropping the stream
/// removes its listener; if it was the last one on the topic the peer is
/// sent an `unsubscribe` notification in the background.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Value>,
    handle: SubscriptionHandle,
    client: Weak<Inner>,
}

impl EventStream {
    // ---

    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Value>,
        handle: SubscriptionHandle,
        client: Weak<Inner>,
    ) -> Self {
        Self { rx, handle, client }
    }

    pub fn topic(&self) -> &str {
        self.handle.topic()
    }

    /// Next payload, or `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

impl futures_util::Stream for EventStream {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        // ---
        let Some(inner) = self.client.upgrade() else {
            return;
        };
        let client = RpcClient { inner };

        if client.remove_listener(&self.handle) != Some(true) {
            return;
        }

        let topic = self.handle.topic().to_owned();
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    client.announce(Notification::Unsubscribe(topic)).await;
                });
            }
            Err(_) => {
                log_debug!("stream on {topic:?} dropped outside a runtime, unsubscribe not sent");
            }
        }
    }
}
