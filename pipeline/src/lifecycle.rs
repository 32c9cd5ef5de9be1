use std::time::Duration;

use crossbeam_channel::{after, select, Receiver};
use humthreads::Builder as ThreadBuilder;
use slog::{info, warn, Logger};

use ductwork_core::{CancelToken, Error, Result, Severity};
use ductwork_engine::{BatchStreamEngine, JobPoolEngine, RunOnceEngine, StreamEngine};

/// Unifies the four engines' by-value `run` methods behind one object-safe
/// interface so `Pipeline` can hold whichever one a `Config` selects
/// without knowing its concrete type.
///
/// Every concrete engine's own `run` consumes `self`, not `&mut self` (each
/// run is single-shot: streams and pools are moved into worker threads),
/// so this trait takes `self: Box<Self>` rather than borrowing.
pub trait RunnableEngine: Send {
    fn run(self: Box<Self>, cancel: &CancelToken) -> Result<()>;
}

impl RunnableEngine for StreamEngine {
    fn run(self: Box<Self>, cancel: &CancelToken) -> Result<()> {
        StreamEngine::run(*self, cancel)
    }
}

impl RunnableEngine for BatchStreamEngine {
    fn run(self: Box<Self>, cancel: &CancelToken) -> Result<()> {
        BatchStreamEngine::run(*self, cancel)
    }
}

impl RunnableEngine for JobPoolEngine {
    fn run(self: Box<Self>, cancel: &CancelToken) -> Result<()> {
        JobPoolEngine::run(*self, cancel)
    }
}

impl RunnableEngine for RunOnceEngine {
    fn run(self: Box<Self>, cancel: &CancelToken) -> Result<()> {
        RunOnceEngine::run(*self, cancel)
    }
}

/// Owns a running engine's cancellation token and lets the caller drive
/// graceful shutdown with a deadline.
///
/// Grounded on the reference source's top-level `run`/`Close` pair: a
/// pipeline is started once, runs until told to stop or until it fails on
/// its own, and shutdown always has a hard deadline so a stuck handler
/// can't hang process exit forever.
pub struct Pipeline {
    cancel: CancelToken,
    done: Receiver<Result<()>>,
    logger: Logger,
}

impl Pipeline {
    /// Spawns `engine` on its own managed thread and returns immediately.
    pub fn start(engine: Box<dyn RunnableEngine>, logger: Logger) -> Result<Pipeline> {
        let cancel = CancelToken::new();
        let run_cancel = cancel.clone();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let run_logger = logger.clone();

        ThreadBuilder::new("d:pipeline:run")
            .full_name("ductwork:pipeline:run")
            .spawn(move |_scope| {
                let result = engine.run(&run_cancel);
                if let Err(err) = &result {
                    warn!(run_logger, "pipeline engine stopped with an error"; "error" => %err);
                }
                let _ = done_tx.send(result);
            })
            .map_err(|e| Error::wrap("pipeline.start", Severity::Fatal, e))?;

        Ok(Pipeline {
            cancel,
            done: done_rx,
            logger,
        })
    }

    /// The token the running engine observes; useful for wiring external
    /// shutdown signals (e.g. a `ctrl_c` handler) without going through
    /// [`Pipeline::shutdown`].
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Cancels the engine and blocks for up to `deadline` for it to stop.
    /// Returns the engine's own result if it stopped in time, or a `Fatal`
    /// timeout error if `deadline` elapsed first (the engine's thread is
    /// left to finish on its own; it is never forcibly killed).
    pub fn shutdown(self, deadline: Duration) -> Result<()> {
        info!(self.logger, "shutting down pipeline"; "deadline_ms" => deadline.as_millis() as u64);
        self.cancel.cancel();
        let timeout = after(deadline);
        select! {
            recv(self.done) -> result => result.unwrap_or_else(|_| {
                Err(Error::msg("pipeline.shutdown", Severity::Fatal, "engine thread vanished without a result"))
            }),
            recv(timeout) -> _ => Err(Error::msg(
                "pipeline.shutdown",
                Severity::Fatal,
                "engine did not stop within the shutdown deadline",
            )),
        }
    }

    /// Blocks until the engine stops on its own (end of input, or a fatal
    /// error), without requesting cancellation. Long-running pipelines
    /// normally call [`Pipeline::shutdown`] instead once a shutdown signal
    /// arrives; this is for one-shot engines like `RunOnceEngine`.
    pub fn wait(self) -> Result<()> {
        self.done
            .recv()
            .unwrap_or_else(|_| Err(Error::msg("pipeline.wait", Severity::Fatal, "engine thread vanished without a result")))
    }
}
