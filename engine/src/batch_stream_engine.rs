use std::sync::Arc;
use std::time::Duration;

use humthreads::Builder as ThreadBuilder;
use slog::{debug, warn, Logger};

use ductwork_core::{BatchHandler, CancelToken, Error, RawMessage, Result, Severity, Stream};

use crate::common::ProcessorError;

/// Same per-stream topology as [`crate::stream_engine::StreamEngine`], but
/// the inner loop accumulates a batch of up to `max_batch_size` messages
/// (within `max_batch_timeout`) before calling the batch handler, and
/// commits the whole batch atomically via one `stream.done` call.
pub struct BatchStreamEngine {
    streams: Vec<Box<dyn Stream>>,
    handler: Arc<dyn BatchHandler>,
    max_batch_size: usize,
    max_batch_timeout: Duration,
    logger: Logger,
}

impl BatchStreamEngine {
    pub fn new(
        streams: Vec<Box<dyn Stream>>,
        handler: Arc<dyn BatchHandler>,
        max_batch_size: usize,
        max_batch_timeout: Duration,
        logger: Logger,
    ) -> BatchStreamEngine {
        BatchStreamEngine {
            streams,
            handler,
            max_batch_size,
            max_batch_timeout,
            logger,
        }
    }

    pub fn run(self, cancel: &CancelToken) -> Result<()> {
        let run_cancel = cancel.with_cancel();
        let errors = Arc::new(ProcessorError::new());
        let mut handles = Vec::with_capacity(self.streams.len());
        let max_batch_size = self.max_batch_size;
        let max_batch_timeout = self.max_batch_timeout;

        for (idx, stream) in self.streams.into_iter().enumerate() {
            let handler = Arc::clone(&self.handler);
            let logger = self.logger.new(slog::o!("stream" => idx));
            let worker_cancel = run_cancel.clone();
            let errors = Arc::clone(&errors);
            let name = format!("d:eng:batch:{}", idx);

            let spawned = ThreadBuilder::new(name.clone())
                .full_name(format!("ductwork:engine:batch-stream-engine:{}", idx))
                .spawn(move |scope| {
                    poll_stream(
                        &scope,
                        stream,
                        handler.as_ref(),
                        max_batch_size,
                        max_batch_timeout,
                        &worker_cancel,
                        &errors,
                        &logger,
                    )
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    run_cancel.cancel();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(Error::wrap("batch_stream_engine.run", Severity::Fatal, err)
                        .context("stream_index", idx.to_string()));
                }
            }
        }

        for handle in handles {
            if let Err(panic) = handle.join() {
                warn!(self.logger, "batch stream engine worker thread panicked"; "panic" => ?panic);
            }
        }

        match errors.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn poll_stream(
    scope: &humthreads::ThreadScope,
    mut stream: Box<dyn Stream>,
    handler: &dyn BatchHandler,
    max_batch_size: usize,
    max_batch_timeout: Duration,
    run_cancel: &CancelToken,
    errors: &ProcessorError,
    logger: &Logger,
) {
    while !run_cancel.is_cancelled() {
        let (batch, eof) = collect_batch(
            scope,
            stream.as_mut(),
            max_batch_size,
            max_batch_timeout,
            run_cancel,
            logger,
        );

        if !batch.is_empty() {
            scope.activity(format!("handling batch of {} messages", batch.len()));
            if !handle_with_retry(handler, &batch, run_cancel, errors) {
                return;
            }
            if let Err(err) = stream.done(run_cancel) {
                warn!(logger, "batch stream commit failed"; "error" => %err);
            }
        }

        if eof {
            break;
        }
    }
}

/// Accumulates up to `max_batch_size` messages from `stream`, bounded by
/// `max_batch_timeout` (zero means no deadline). Returns the batch
/// collected so far and whether the stream reported end-of-input.
fn collect_batch(
    scope: &humthreads::ThreadScope,
    stream: &mut dyn Stream,
    max_batch_size: usize,
    max_batch_timeout: Duration,
    run_cancel: &CancelToken,
    logger: &Logger,
) -> (Vec<RawMessage>, bool) {
    let batch_cancel = if max_batch_timeout.is_zero() {
        run_cancel.clone()
    } else {
        run_cancel.with_deadline(max_batch_timeout)
    };

    let mut batch = Vec::with_capacity(max_batch_size);
    while !batch_cancel.is_cancelled() && batch.len() < max_batch_size {
        scope.activity(format!("accumulating batch ({}/{})", batch.len(), max_batch_size));
        match stream.next(&batch_cancel) {
            Ok(msg) => batch.push(msg),
            Err(err) if err.is_eof() => return (batch, true),
            Err(err) => {
                debug!(logger, "transient error accumulating batch, retrying"; "error" => %err);
                if run_cancel.is_cancelled() {
                    break;
                }
            }
        }
    }
    (batch, false)
}

fn handle_with_retry(
    handler: &dyn BatchHandler,
    batch: &[RawMessage],
    run_cancel: &CancelToken,
    errors: &ProcessorError,
) -> bool {
    loop {
        let background = CancelToken::background();
        match handler.batch_handle(&background, batch) {
            Ok(()) => return true,
            Err(err) => {
                if err.severity() == Severity::Fatal {
                    errors.set_first(err);
                    run_cancel.cancel();
                    return false;
                }
                if run_cancel.is_cancelled() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ductwork_core::mock::MockStream;
    use slog::{Discard, Logger};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn discard_logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    struct CountingBatchHandler {
        total: Arc<AtomicUsize>,
        batches: Mutex<Vec<usize>>,
    }

    impl BatchHandler for CountingBatchHandler {
        fn batch_handle(&self, _cancel: &CancelToken, msgs: &[RawMessage]) -> Result<()> {
            self.total.fetch_add(msgs.len(), Ordering::SeqCst);
            self.batches.lock().unwrap().push(msgs.len());
            Ok(())
        }
    }

    #[test]
    fn batches_respect_max_size_and_cover_every_message() {
        let total = Arc::new(AtomicUsize::new(0));
        let streams: Vec<Box<dyn Stream>> = (0..5)
            .map(|s| {
                let msgs = (0..100)
                    .map(|i| RawMessage::new(format!("{}-{}", s, i).into_bytes()))
                    .collect();
                Box::new(MockStream::new(msgs)) as Box<dyn Stream>
            })
            .collect();
        let handler = Arc::new(CountingBatchHandler {
            total: Arc::clone(&total),
            batches: Mutex::new(Vec::new()),
        });
        let engine = BatchStreamEngine::new(
            streams,
            handler.clone(),
            11,
            Duration::from_millis(100),
            discard_logger(),
        );
        let cancel = CancelToken::new();
        engine.run(&cancel).unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 500);
        assert!(handler.batches.lock().unwrap().iter().all(|&n| n <= 11));
    }
}
