use std::time::Duration;

use slog::{debug, warn, Logger};

use ductwork_core::{BatchHandler, CancelToken, RawMessage, Result, Severity, Stream};

/// Drains up to `max_batch_size` messages from a single stream within
/// `max_batch_timeout`, processes them once as a batch, and returns —
/// no worker threads, no retry loop. Used for one-shot batch jobs (e.g. a
/// cron-triggered drain) rather than a long-running service.
///
/// Grounded on the reference source's `runoncenegine` package, kept to the
/// same single-attempt semantics: a non-fatal batch error is swallowed
/// (and logged) without committing, leaving the messages to be redelivered
/// on the next run; only a fatal error is returned to the caller.
pub struct RunOnceEngine {
    stream: Box<dyn Stream>,
    handler: Box<dyn BatchHandler>,
    max_batch_size: usize,
    max_batch_timeout: Duration,
    logger: Logger,
}

impl RunOnceEngine {
    pub fn new(
        stream: Box<dyn Stream>,
        handler: Box<dyn BatchHandler>,
        max_batch_size: usize,
        max_batch_timeout: Duration,
        logger: Logger,
    ) -> RunOnceEngine {
        RunOnceEngine {
            stream,
            handler,
            max_batch_size,
            max_batch_timeout,
            logger,
        }
    }

    /// Runs the single drain-and-process cycle. Returns `Ok(())` whether or
    /// not any messages were found; only a fatal handler error or a stream
    /// error other than end-of-input surfaces as `Err`.
    pub fn run(mut self, cancel: &CancelToken) -> Result<()> {
        let batch_cancel = if self.max_batch_timeout.is_zero() {
            cancel.clone()
        } else {
            cancel.with_deadline(self.max_batch_timeout)
        };

        let mut batch = Vec::with_capacity(self.max_batch_size);
        while !batch_cancel.is_cancelled() && batch.len() < self.max_batch_size {
            match self.stream.next(&batch_cancel) {
                Ok(msg) => batch.push(msg),
                Err(err) if err.is_eof() => break,
                Err(err) => {
                    debug!(self.logger, "transient error draining stream, retrying"; "error" => %err);
                    if cancel.is_cancelled() {
                        break;
                    }
                }
            }
        }

        if batch.is_empty() {
            return Ok(());
        }

        let background = CancelToken::background();
        match self.handler.batch_handle(&background, &batch) {
            Ok(()) => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if let Err(err) = self.stream.done(cancel) {
                    warn!(self.logger, "run-once commit failed"; "error" => %err);
                }
                Ok(())
            }
            Err(err) => {
                if err.severity() == Severity::Fatal {
                    return Err(err);
                }
                warn!(self.logger, "run-once batch failed, leaving messages uncommitted"; "error" => %err);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ductwork_core::mock::MockStream;
    use ductwork_core::Error;
    use slog::{Discard, Logger};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn discard_logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    struct CountingBatchHandler {
        total: Arc<AtomicUsize>,
    }

    impl BatchHandler for CountingBatchHandler {
        fn batch_handle(&self, _cancel: &CancelToken, msgs: &[RawMessage]) -> Result<()> {
            self.total.fetch_add(msgs.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn drains_available_messages_once_and_commits() {
        let msgs = (0..5).map(|i| RawMessage::new(vec![i])).collect();
        let stream = Box::new(MockStream::new(msgs));
        let total = Arc::new(AtomicUsize::new(0));
        let handler = Box::new(CountingBatchHandler {
            total: Arc::clone(&total),
        });
        let engine = RunOnceEngine::new(stream, handler, 10, Duration::from_millis(50), discard_logger());
        let cancel = CancelToken::new();
        engine.run(&cancel).unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    struct FatalBatchHandler;
    impl BatchHandler for FatalBatchHandler {
        fn batch_handle(&self, _cancel: &CancelToken, _msgs: &[RawMessage]) -> Result<()> {
            Err(Error::msg("test.batch", Severity::Fatal, "boom"))
        }
    }

    #[test]
    fn fatal_batch_error_is_returned() {
        let msgs = vec![RawMessage::new(b"x".to_vec())];
        let stream = Box::new(MockStream::new(msgs));
        let engine = RunOnceEngine::new(
            stream,
            Box::new(FatalBatchHandler),
            10,
            Duration::from_millis(50),
            discard_logger(),
        );
        let cancel = CancelToken::new();
        let err = engine.run(&cancel).unwrap_err();
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[test]
    fn empty_stream_returns_ok_without_handler_call() {
        let stream = Box::new(MockStream::new(Vec::new()));
        let engine = RunOnceEngine::new(
            stream,
            Box::new(FatalBatchHandler),
            10,
            Duration::from_millis(50),
            discard_logger(),
        );
        let cancel = CancelToken::new();
        engine.run(&cancel).unwrap();
    }
}
