use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::CallId;
use crate::{Result, RpcError};

/// Settlement delivered to a waiting caller.
pub(crate) type CallOutcome = Result<Value>;

/// Tracks calls that have been sent and are waiting for a response.
///
/// Maps call identifiers to oneshot channels. Each entry is removed the
/// moment it is settled, so every call sees exactly one outcome. Settling an
/// identifier that is no longer present is a no-op: the call may already
/// have been abandoned by a timeout or drained on connection loss.
pub(crate) struct PendingCalls {
    // ---
    calls: HashMap<CallId, oneshot::Sender<CallOutcome>>,
}

impl PendingCalls {
    // ---

    pub fn new() -> Self {
        // ---
        Self {
            calls: HashMap::new(),
        }
    }

    /// Register a new pending call.
    ///
    /// Returns a receiver that yields the call's outcome.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::DuplicateId` if `id` is already pending. The
    /// existing entry is left untouched.
    pub fn register(&mut self, id: CallId) -> Result<oneshot::Receiver<CallOutcome>> {
        // ---
        if self.calls.contains_key(&id) {
            return Err(RpcError::DuplicateId(id));
        }

        let (tx, rx) = oneshot::channel();
        self.calls.insert(id, tx);
        Ok(rx)
    }

    /// Fulfil a pending call with its result value.
    ///
    /// Returns true if the id was pending.
    pub fn resolve(&mut self, id: CallId, value: Value) -> bool {
        // ---
        self.settle(id, Ok(value))
    }

    /// Fail a pending call.
    ///
    /// Returns true if the id was pending.
    pub fn reject(&mut self, id: CallId, err: RpcError) -> bool {
        // ---
        self.settle(id, Err(err))
    }

    /// Remove a pending call without settling it.
    ///
    /// The waiting receiver observes a closed channel.
    pub fn remove(&mut self, id: CallId) -> bool {
        // ---
        self.calls.remove(&id).is_some()
    }

    /// Reject every pending call with an error built by `make_err`, then
    /// clear the table.
    ///
    /// Returns the number of calls drained.
    pub fn drain_all<F>(&mut self, make_err: F) -> usize
    where
        F: Fn() -> RpcError,
    {
        // ---
        let drained = self.calls.len();
        for (_, tx) in self.calls.drain() {
            let _ = tx.send(Err(make_err()));
        }
        drained
    }

    pub fn len(&self) -> usize {
        // ---
        self.calls.len()
    }

    fn settle(&mut self, id: CallId, outcome: CallOutcome) -> bool {
        // ---
        match self.calls.remove(&id) {
            Some(tx) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::ServerError;
    use serde_json::json;

    #[test]
    fn test_register_and_resolve() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CallId::new(1);

        let rx = pending.register(id).unwrap();
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve(id, json!({"message": "hi"})));
        assert_eq!(pending.len(), 0);

        let outcome = rx.blocking_recv().unwrap();
        assert_eq!(outcome.unwrap(), json!({"message": "hi"}));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CallId::new(5);

        let rx = pending.register(id).unwrap();
        assert!(matches!(
            pending.register(id),
            Err(RpcError::DuplicateId(dup)) if dup == id
        ));

        // The original entry still settles normally.
        assert!(pending.resolve(id, json!(1)));
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), json!(1));
    }

    #[test]
    fn test_reject_delivers_server_error() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CallId::new(2);
        let rx = pending.register(id).unwrap();

        assert!(pending.reject(id, RpcError::Server(ServerError::new("denied"))));

        match rx.blocking_recv().unwrap() {
            Err(RpcError::Server(err)) => assert_eq!(err.message, "denied"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_settle_unknown_id_is_noop() {
        // ---
        let mut pending = PendingCalls::new();
        assert!(!pending.resolve(CallId::new(9), json!(null)));
        assert!(!pending.reject(CallId::new(9), RpcError::ConnectionLost));
        assert!(!pending.remove(CallId::new(9)));
    }

    #[test]
    fn test_settles_only_once() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CallId::new(3);
        let rx = pending.register(id).unwrap();

        assert!(pending.resolve(id, json!("first")));
        assert!(!pending.resolve(id, json!("second")));
        assert_eq!(rx.blocking_recv().unwrap().unwrap(), json!("first"));
    }

    #[test]
    fn test_drain_all_rejects_everything() {
        // ---
        let mut pending = PendingCalls::new();
        let receivers: Vec<_> = (1..=3)
            .map(|raw| pending.register(CallId::new(raw)).unwrap())
            .collect();

        assert_eq!(pending.drain_all(|| RpcError::ConnectionLost), 3);
        assert_eq!(pending.len(), 0);

        for rx in receivers {
            assert!(matches!(
                rx.blocking_recv().unwrap(),
                Err(RpcError::ConnectionLost)
            ));
        }

        // A late response after the drain finds nothing.
        assert!(!pending.resolve(CallId::new(1), json!(null)));
    }

    #[test]
    fn test_remove_closes_receiver() {
        // ---
        let mut pending = PendingCalls::new();
        let id = CallId::new(4);
        let rx = pending.register(id).unwrap();

        assert!(pending.remove(id));
        assert!(rx.blocking_recv().is_err());
    }
}
