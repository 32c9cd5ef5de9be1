use std::sync::Mutex;

use crossbeam_channel::{bounded, select, Receiver, Sender};

use ductwork_core::{CancelToken, Error, RawMessage, Result};

/// A half-duplex job pool of size one: the rendezvous that lets a
/// synchronous [`super::stream::KafkaStreamAdapter::next`] drive an
/// asynchronous background poll thread without losing a result in flight.
///
/// The SDK's blocking read must be cancellable, but `next(cancel)` needs to
/// return cleanly on cancellation even while a poll is mid-flight. A caller
/// that cancels and later calls `next` again must still be able to collect
/// whatever the background poller eventually produces for the outstanding
/// job: that is the entire reason `request_job` is idempotent while
/// pending, and why `get_result` leaves `pending` set on cancellation
/// instead of clearing it.
pub struct RequestController {
    pending: Mutex<bool>,
    worker_signal: (Sender<()>, Receiver<()>),
    result: (Sender<Result<RawMessage>>, Receiver<Result<RawMessage>>),
    closed: CancelToken,
}

impl RequestController {
    pub fn new() -> RequestController {
        RequestController {
            pending: Mutex::new(false),
            worker_signal: bounded(1),
            result: bounded(0),
            closed: CancelToken::new(),
        }
    }

    /// Ensures a poll job is outstanding. Idempotent while one already is.
    pub fn request_job(&self) -> Result<()> {
        let mut pending = self.pending.lock().expect("RequestController mutex poisoned");
        if *pending {
            return Ok(());
        }
        if self.closed.is_cancelled() {
            return Err(Error::eof("request_controller.request_job"));
        }
        *pending = true;
        // The mutex guarantees at most one thread ever observes `pending`
        // flip from false to true, so this send cannot block: the channel
        // has room for exactly one outstanding token.
        let _ = self.worker_signal.0.try_send(());
        Ok(())
    }

    /// Blocks for the result of the outstanding job, or for `cancel`/closure.
    /// On cancellation, `pending` is left set: a later `get_result` call can
    /// still collect the poll that is already in flight.
    pub fn get_result(&self, cancel: &CancelToken) -> Result<RawMessage> {
        let outcome = select! {
            recv(self.result.1) -> msg => {
                let mut pending = self.pending.lock().expect("RequestController mutex poisoned");
                *pending = false;
                match msg {
                    Ok(result) => result,
                    Err(_) => Err(Error::eof("request_controller.get_result")),
                }
            }
            recv(self.closed.cancel_receiver()) -> _ => Err(Error::eof("request_controller.get_result")),
            recv(cancel.cancel_receiver()) -> _ => Err(Error::cancelled("request_controller.get_result")),
        };
        outcome
    }

    /// Blocks until a job is requested or the controller is closed. Called
    /// only from the background poller thread.
    pub fn get_next_job(&self) -> Result<()> {
        select! {
            recv(self.worker_signal.1) -> _ => Ok(()),
            recv(self.closed.cancel_receiver()) -> _ => Err(Error::eof("request_controller.get_next_job")),
        }
    }

    /// Delivers the poll outcome back to whichever `get_result` call is (or
    /// will be) waiting. Called only from the background poller thread.
    pub fn submit_result(&self, result: Result<RawMessage>) -> Result<()> {
        select! {
            send(self.result.0, result) -> _ => Ok(()),
            recv(self.closed.cancel_receiver()) -> _ => Err(Error::eof("request_controller.submit_result")),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Broadcasts closure: every blocked or future operation returns EOF.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Default for RequestController {
    fn default() -> RequestController {
        RequestController::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn request_job_is_idempotent_while_pending() {
        let controller = RequestController::new();
        controller.request_job().unwrap();
        controller.request_job().unwrap();
        // Only one token should have been queued; draining it twice would
        // block forever on the second recv, so bound the wait.
        assert!(controller.worker_signal.1.recv_timeout(Duration::from_millis(50)).is_ok());
        assert!(controller
            .worker_signal
            .1
            .recv_timeout(Duration::from_millis(20))
            .is_err());
    }

    #[test]
    fn result_round_trips_through_get_result() {
        let controller = RequestController::new();
        controller.request_job().unwrap();
        controller.get_next_job().unwrap();
        controller
            .submit_result(Ok(RawMessage::new(b"hello".to_vec())))
            .unwrap();
        let cancel = CancelToken::new();
        let msg = controller.get_result(&cancel).unwrap();
        assert_eq!(msg.payload(), b"hello");
    }

    #[test]
    fn cancelled_get_result_leaves_job_pending_for_later_collection() {
        let controller = RequestController::new();
        controller.request_job().unwrap();
        controller.get_next_job().unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = controller.get_result(&cancel).unwrap_err();
        assert!(err.is_cancelled());

        // The poll "arrives late" after the caller gave up.
        controller
            .submit_result(Ok(RawMessage::new(b"late".to_vec())))
            .unwrap();
        let fresh_cancel = CancelToken::new();
        let msg = controller.get_result(&fresh_cancel).unwrap();
        assert_eq!(msg.payload(), b"late");
    }

    #[test]
    fn close_unblocks_every_waiter() {
        use std::sync::Arc;

        let controller = Arc::new(RequestController::new());
        let handle = {
            let controller = Arc::clone(&controller);
            thread::spawn(move || controller.get_next_job())
        };
        thread::sleep(Duration::from_millis(20));
        controller.close();
        assert!(handle.join().unwrap().unwrap_err().is_eof());
    }
}
