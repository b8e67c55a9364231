//! Subscription registry: topic name → listeners.
//!
//! Listeners are kept in registration order per topic. The registry is
//! caller intent, not connection state, so it survives link loss; only an
//! explicit unsubscribe or client teardown removes a listener.
//!
//! Dispatch is split in two steps so the registry lock is never held while
//! user code runs: [`SubscriptionRegistry::snapshot`] copies the listener
//! list for a topic, and [`Dispatch::run`] invokes it. A listener may
//! therefore subscribe or unsubscribe from inside its own callback; the
//! change takes effect from the next event.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;

use crate::sink::{report_to, ErrorSink};
use crate::{log_warn, RpcError};

/// Error type a listener may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Return type of a subscription listener.
pub type ListenerResult = std::result::Result<(), ListenerError>;

pub(crate) type Listener = Arc<dyn Fn(&Value) -> ListenerResult + Send + Sync>;

/// Handle identifying one registered listener.
///
/// Passing it to [`RpcClient::unsubscribe`](crate::RpcClient::unsubscribe)
/// removes exactly that listener. Dropping the handle does not unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: Arc<str>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

struct Entry {
    id: u64,
    listener: Listener,
}

pub(crate) struct SubscriptionRegistry {
    // ---
    next_id: u64,
    topics: HashMap<Arc<str>, Vec<Entry>>,
}

impl SubscriptionRegistry {
    // ---

    pub fn new() -> Self {
        Self {
            next_id: 1,
            topics: HashMap::new(),
        }
    }

    /// Add a listener to `topic`.
    ///
    /// Returns the handle and whether this is the first listener on the
    /// topic.
    pub fn subscribe(&mut self, topic: &str, listener: Listener) -> (SubscriptionHandle, bool) {
        // ---
        let id = self.next_id;
        self.next_id += 1;

        let topic: Arc<str> = match self.topics.get_key_value(topic) {
            Some((key, _)) => key.clone(),
            None => Arc::from(topic),
        };
        let entries = self.topics.entry(topic.clone()).or_default();

        let first = entries.is_empty();
        entries.push(Entry { id, listener });

        (SubscriptionHandle { id, topic }, first)
    }

    /// Remove the listener behind `handle`.
    ///
    /// Returns `None` if it was not registered, otherwise whether the topic
    /// has no listeners left.
    pub fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> Option<bool> {
        // ---
        let entries = self.topics.get_mut(&handle.topic)?;
        let pos = entries.iter().position(|entry| entry.id == handle.id)?;
        entries.remove(pos);

        let now_empty = entries.is_empty();
        if now_empty {
            self.topics.remove(&handle.topic);
        }
        Some(now_empty)
    }

    /// Copy the current listeners of `topic`, in registration order.
    pub fn snapshot(&self, topic: &str) -> Dispatch {
        // ---
        let listeners = self
            .topics
            .get(topic)
            .map(|entries| entries.iter().map(|entry| entry.listener.clone()).collect())
            .unwrap_or_default();

        Dispatch {
            topic: topic.to_owned(),
            listeners,
        }
    }

    /// Topics with at least one listener.
    pub fn topics(&self) -> Vec<String> {
        self.topics.keys().map(|topic| topic.to_string()).collect()
    }

    /// Total number of listeners across all topics.
    pub fn len(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }

    /// Remove every listener. Returns the topics that were registered.
    pub fn clear(&mut self) -> Vec<String> {
        let topics = self.topics();
        self.topics.clear();
        topics
    }
}

/// Listeners captured for one event.
pub(crate) struct Dispatch {
    topic: String,
    listeners: Vec<Listener>,
}

impl Dispatch {
    // ---

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Invoke every captured listener with `payload`, in order.
    ///
    /// A listener that returns an error or panics is reported to `sink`;
    /// the remaining listeners still run. Returns the number of failures.
    pub fn run(&self, payload: &Value, sink: &dyn ErrorSink) -> usize {
        // ---
        let mut failures = 0;

        for listener in &self.listeners {
            let message = match catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };

            failures += 1;
            log_warn!("listener on topic {:?} failed: {message}", self.topic);

            let err = RpcError::Listener {
                topic: self.topic.clone(),
                message,
            };
            report_to(sink, &err);
        }

        failures
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("topic", &self.topic)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    // ---
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("listener panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("listener panicked: {msg}")
    } else {
        "listener panicked".to_owned()
    }
}
