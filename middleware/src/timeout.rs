use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ductwork_core::{CancelToken, Error, Handler, RawMessage, Result, Severity};

/// Wraps a [`Handler`] with a bounded deadline.
///
/// If the inner handler does not return before `timeout`, this returns a
/// `Fatal`-severity timeout error so a stuck handler surfaces loudly
/// instead of silently retrying forever, and so the engine that owns this
/// call can make progress rather than hanging on one message forever. The
/// inner call keeps running on its own detached thread to completion rather
/// than being aborted mid-flight — a scoped, joined thread would block this
/// call for as long as the handler actually takes, defeating the point of a
/// bounded deadline — its eventual result is simply discarded once nobody
/// is listening for it anymore.
pub struct TimeoutHandler<H> {
    inner: Arc<H>,
    timeout: Duration,
}

impl<H: Handler + 'static> TimeoutHandler<H> {
    pub fn new(inner: H, timeout: Duration) -> TimeoutHandler<H> {
        TimeoutHandler {
            inner: Arc::new(inner),
            timeout,
        }
    }
}

impl<H: Handler + 'static> Handler for TimeoutHandler<H> {
    fn handle(&self, cancel: &CancelToken, msg: &RawMessage) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let cancel = cancel.clone();
        let msg = msg.clone();
        thread::spawn(move || {
            let result = catch_unwind(AssertUnwindSafe(|| inner.handle(&cancel, &msg)));
            let _ = tx.send(result);
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(Error::msg(
                "timeout_handler.handle",
                Severity::Fatal,
                panic_message(panic),
            )),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::msg(
                "timeout_handler.handle",
                Severity::Fatal,
                format!("handler did not return within {:?}", self.timeout),
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::msg(
                "timeout_handler.handle",
                Severity::Fatal,
                "handler thread disconnected without a result",
            )),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}
