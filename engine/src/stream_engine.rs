use std::sync::Arc;

use humthreads::Builder as ThreadBuilder;
use slog::{debug, warn, Logger};

use ductwork_core::{CancelToken, Error, Handler, Result, Severity, Stream};

use crate::common::{safe_handle, ProcessorError};

/// Processes one message at a time from each of several ordered `Stream`s,
/// one worker thread per stream, preserving per-stream order.
///
/// Grounded on the reference source's `streamengine` package: one
/// goroutine per stream becomes one managed thread per stream here, and
/// the retry-until-success-or-fatal loop around `handler.handle` is kept
/// unchanged in shape.
pub struct StreamEngine {
    streams: Vec<Box<dyn Stream>>,
    handler: Arc<dyn Handler>,
    logger: Logger,
}

impl StreamEngine {
    pub fn new(streams: Vec<Box<dyn Stream>>, handler: Arc<dyn Handler>, logger: Logger) -> StreamEngine {
        StreamEngine {
            streams,
            handler,
            logger,
        }
    }

    /// Runs until every stream reaches end-of-input, a fatal error self
    /// closes the engine, or `cancel` is cancelled by the caller.
    ///
    /// Workers are dispatched on a child token derived from `cancel` via
    /// `with_cancel`, so a fatal error on one stream cancels the rest
    /// without touching the caller's own token.
    pub fn run(self, cancel: &CancelToken) -> Result<()> {
        let run_cancel = cancel.with_cancel();
        let errors = Arc::new(ProcessorError::new());
        let mut handles = Vec::with_capacity(self.streams.len());

        for (idx, stream) in self.streams.into_iter().enumerate() {
            let handler = Arc::clone(&self.handler);
            let logger = self.logger.new(slog::o!("stream" => idx));
            let worker_cancel = run_cancel.clone();
            let errors = Arc::clone(&errors);
            let name = format!("d:eng:stream:{}", idx);

            let spawned = ThreadBuilder::new(name.clone())
                .full_name(format!("ductwork:engine:stream-engine:{}", idx))
                .spawn(move |scope| {
                    poll_stream(&scope, stream, handler.as_ref(), &worker_cancel, &errors, &logger)
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    run_cancel.cancel();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(Error::wrap("stream_engine.run", Severity::Fatal, err)
                        .context("stream_index", idx.to_string()));
                }
            }
        }

        for handle in handles {
            if let Err(panic) = handle.join() {
                warn!(self.logger, "stream engine worker thread panicked"; "panic" => ?panic);
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
    handler: &dyn Handler,
    run_cancel: &CancelToken,
    errors: &ProcessorError,
    logger: &Logger,
) {
    while !run_cancel.is_cancelled() {
        scope.activity("waiting for next message".to_string());
        let msg = match stream.next(run_cancel) {
            Ok(msg) => msg,
            Err(err) if err.is_eof() => break,
            Err(err) => {
                debug!(logger, "transient error polling stream, retrying"; "error" => %err);
                continue;
            }
        };

        scope.activity("handling message".to_string());
        if !handle_with_retry(handler, &msg, run_cancel, errors) {
            return;
        }

        if let Err(err) = stream.done(run_cancel) {
            warn!(logger, "stream commit failed"; "error" => %err);
        }
    }
}

/// Retries `handler.handle` against `msg` until it succeeds, a fatal error
/// self-closes the engine, or the run is cancelled between attempts.
/// Returns `false` when the caller should stop polling (fatal or
/// cancelled), `true` once the message has been handled successfully.
fn handle_with_retry(
    handler: &dyn Handler,
    msg: &ductwork_core::RawMessage,
    run_cancel: &CancelToken,
    errors: &ProcessorError,
) -> bool {
    loop {
        let background = CancelToken::background();
        match safe_handle(handler, &background, msg) {
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
