use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use ductwork_core::{CancelToken, Error, Handler, RawMessage, Result, Severity};

/// Invokes `handler.handle` and converts a panic into a `Runtime`-severity
/// error instead of unwinding across the worker thread boundary and taking
/// down the whole engine with it.
///
/// Grounded on the reference source's `engine.SafeProcess`: one bad message
/// should surface as an error the engine's retry/nack policy can act on, not
/// crash a worker that other streams or sibling workers don't get a chance
/// to recover from. `Runtime`, not `Fatal`: a panicking message must not
/// abort the whole pool, only fail/retry that one message, so a job pool
/// worker keeps draining the remaining backlog after a panic.
pub fn safe_handle(handler: &dyn Handler, cancel: &CancelToken, msg: &RawMessage) -> Result<()> {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(cancel, msg))) {
        Ok(result) => result,
        Err(payload) => Err(Error::msg(
            "engine.safe_handle",
            Severity::Runtime,
            panic_message(payload),
        )),
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

/// Captures at most one processor error, keeping the first one reported.
/// Shared across worker threads that race to self-close the engine on a
/// fatal error.
#[derive(Default)]
pub struct ProcessorError {
    error: Mutex<Option<Error>>,
}

impl ProcessorError {
    pub fn new() -> ProcessorError {
        ProcessorError {
            error: Mutex::new(None),
        }
    }

    /// Records `err` if no error has been recorded yet. Later calls are
    /// ignored: only the first fatal error an engine observes surfaces
    /// from `run`.
    pub fn set_first(&self, err: Error) {
        let mut guard = self.error.lock().expect("ProcessorError mutex poisoned");
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn take(&self) -> Option<Error> {
        self.error.lock().expect("ProcessorError mutex poisoned").take()
    }
}
