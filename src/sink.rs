//! Error sink: where the client reports failures nobody awaits.
//!
//! Per-call failures go back to the caller that issued the call. Everything
//! else (a dropped link, a failing subscription listener) has no caller to
//! return to and is reported here instead. The sink is a presentation
//! concern; typically it shows the error to the user.
//!
//! The client invokes the sink at most once per failure event and guards
//! against a sink that panics.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::{log_error, RpcError};

/// Receiver for failures that are not tied to a single call.
pub trait ErrorSink: Send + Sync {
    /// Report one failure. Implementations must not block.
    fn report(&self, err: &RpcError);
}

impl<F> ErrorSink for F
where
    F: Fn(&RpcError) + Send + Sync,
{
    fn report(&self, err: &RpcError) {
        self(err)
    }
}

/// Shared error sink pointer.
pub type ErrorSinkPtr = Arc<dyn ErrorSink>;

/// Default sink: writes every failure to the error log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn report(&self, _err: &RpcError) {
        log_error!("rpc failure: {_err}");
    }
}

/// Deliver `err` to `sink`, containing any panic raised by the sink.
pub(crate) fn report_to(sink: &dyn ErrorSink, err: &RpcError) {
    // ---
    if catch_unwind(AssertUnwindSafe(|| sink.report(err))).is_err() {
        log_error!("error sink panicked while reporting: {err}");
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn closure_sink_receives_error() {
        // ---
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |err: &RpcError| seen.lock().unwrap().push(err.to_string())
        };

        report_to(&sink, &RpcError::ConnectionLost);
        assert_eq!(*seen.lock().unwrap(), vec!["connection lost".to_string()]);
    }

    #[test]
    fn panicking_sink_is_contained() {
        // ---
        let sink = |_: &RpcError| panic!("sink blew up");
        report_to(&sink, &RpcError::NotConnected);
    }
}
