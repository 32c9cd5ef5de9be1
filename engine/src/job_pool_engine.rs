use std::sync::Arc;

use crossbeam_channel::{bounded, select};
use humthreads::Builder as ThreadBuilder;
use slog::{debug, warn, Logger};

use ductwork_core::{CancelToken, Error, Handler, MessagePool, RawMessage, Result, Severity};

use crate::common::{safe_handle, ProcessorError};

/// Processes messages from an unordered `MessagePool` with `n_workers`
/// concurrent worker threads behind a single poller.
///
/// Grounded on the reference source's `jobpoolengine` package: a single
/// poller goroutine feeds an unbuffered channel that `n_workers` worker
/// goroutines read from, so at most one message is ever "in flight"
/// between poller and an idle worker. Here the unbuffered channel is a
/// zero-capacity `crossbeam_channel`, which gives the same handoff
/// rendezvous without polling.
pub struct JobPoolEngine {
    pool: Arc<dyn MessagePool>,
    handler: Arc<dyn Handler>,
    n_workers: usize,
    logger: Logger,
}

impl JobPoolEngine {
    pub fn new(
        pool: Arc<dyn MessagePool>,
        handler: Arc<dyn Handler>,
        n_workers: usize,
        logger: Logger,
    ) -> JobPoolEngine {
        JobPoolEngine {
            pool,
            handler,
            n_workers,
            logger,
        }
    }

    pub fn run(self, cancel: &CancelToken) -> Result<()> {
        let run_cancel = cancel.with_cancel();
        let errors = Arc::new(ProcessorError::new());
        let (next_tx, next_rx) = bounded::<RawMessage>(0);
        let mut handles = Vec::with_capacity(self.n_workers + 1);

        for idx in 0..self.n_workers {
            let pool = Arc::clone(&self.pool);
            let handler = Arc::clone(&self.handler);
            let logger = self.logger.new(slog::o!("worker" => idx));
            let worker_cancel = run_cancel.clone();
            let errors = Arc::clone(&errors);
            let next_rx = next_rx.clone();
            let name = format!("d:eng:jobpool:w:{}", idx);

            let spawned = ThreadBuilder::new(name)
                .full_name(format!("ductwork:engine:job-pool-engine:worker:{}", idx))
                .spawn(move |scope| {
                    worker_loop(&scope, next_rx, pool.as_ref(), handler.as_ref(), &worker_cancel, &errors, &logger)
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    run_cancel.cancel();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(Error::wrap("job_pool_engine.run", Severity::Fatal, err)
                        .context("worker_index", idx.to_string()));
                }
            }
        }

        {
            let pool = Arc::clone(&self.pool);
            let logger = self.logger.clone();
            let poller_cancel = run_cancel.clone();
            let spawned = ThreadBuilder::new("d:eng:jobpool:poller")
                .full_name("ductwork:engine:job-pool-engine:poller".to_string())
                .spawn(move |scope| poller_loop(&scope, pool.as_ref(), next_tx, &poller_cancel, &logger));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    run_cancel.cancel();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(Error::wrap("job_pool_engine.run", Severity::Fatal, err));
                }
            }
        }

        for handle in handles {
            if let Err(panic) = handle.join() {
                warn!(self.logger, "job pool engine thread panicked"; "panic" => ?panic);
            }
        }

        match errors.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn poller_loop(
    scope: &humthreads::ThreadScope,
    pool: &dyn MessagePool,
    next_tx: crossbeam_channel::Sender<RawMessage>,
    run_cancel: &CancelToken,
    logger: &Logger,
) {
    while !run_cancel.is_cancelled() {
        scope.activity("polling message pool".to_string());
        let msg = match pool.next(run_cancel) {
            Ok(msg) => msg,
            Err(err) if err.is_eof() => break,
            Err(err) => {
                debug!(logger, "transient error polling message pool, retrying"; "error" => %err);
                continue;
            }
        };

        scope.activity("handing message to a worker".to_string());
        select! {
            send(next_tx, msg) -> _ => continue,
            recv(run_cancel.cancel_receiver()) -> _ => break,
        }
    }
}

fn worker_loop(
    scope: &humthreads::ThreadScope,
    next_rx: crossbeam_channel::Receiver<RawMessage>,
    pool: &dyn MessagePool,
    handler: &dyn Handler,
    run_cancel: &CancelToken,
    errors: &ProcessorError,
    logger: &Logger,
) {
    loop {
        scope.activity("waiting for work".to_string());
        let msg = select! {
            recv(next_rx) -> msg => match msg {
                Ok(msg) => msg,
                Err(_) => return,
            },
            recv(run_cancel.cancel_receiver()) -> _ => return,
        };

        scope.activity("handling message".to_string());
        let background = CancelToken::background();
        match safe_handle(handler, &background, &msg) {
            Ok(()) => {
                if let Err(err) = pool.done(run_cancel, &msg) {
                    debug!(logger, "pool ack failed"; "error" => %err);
                }
            }
            Err(err) => {
                if err.severity() == Severity::Fatal {
                    errors.set_first(err);
                    run_cancel.cancel();
                    return;
                }
                if let Err(err) = pool.failed(run_cancel, &msg) {
                    debug!(logger, "pool nack failed"; "error" => %err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ductwork_core::mock::MockPool;
    use ductwork_core::RawMessage;
    use slog::{Discard, Logger};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn discard_logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    struct CountingHandler {
        successes: Arc<AtomicUsize>,
    }

    impl Handler for CountingHandler {
        fn handle(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
            self.successes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn concurrent_workers_drain_pool_without_duplication() {
        let successes = Arc::new(AtomicUsize::new(0));
        let msgs = (0..200).map(|i| RawMessage::new(vec![i as u8])).collect();
        let pool: Arc<dyn MessagePool> = Arc::new(MockPool::new(msgs));
        let handler = Arc::new(CountingHandler {
            successes: Arc::clone(&successes),
        });
        let engine = JobPoolEngine::new(pool, handler, 8, discard_logger());
        let cancel = CancelToken::new();
        engine.run(&cancel).unwrap();
        assert_eq!(successes.load(Ordering::SeqCst), 200);
    }

    /// A pool that redelivers `failed` messages instead of dropping them,
    /// like a real broker's nack-then-redeliver subscription. Needed to
    /// exercise the panic-recovery path: `MockPool` only records acks, it
    /// doesn't requeue on `failed`.
    ///
    /// `outstanding` tracks messages handed out by `next` that have not yet
    /// been acked or nacked, so an empty `pending` queue only means EOF once
    /// nothing still in flight could come back for redelivery. Both fields
    /// live behind one lock so the EOF decision in `next` can never race a
    /// worker's `failed` pushing a message back in.
    struct RedeliveringPool {
        state: Mutex<RedeliveringState>,
    }

    struct RedeliveringState {
        pending: VecDeque<RawMessage>,
        outstanding: usize,
    }

    impl RedeliveringPool {
        fn new(messages: Vec<RawMessage>) -> RedeliveringPool {
            RedeliveringPool {
                state: Mutex::new(RedeliveringState {
                    pending: messages.into(),
                    outstanding: 0,
                }),
            }
        }
    }

    impl MessagePool for RedeliveringPool {
        fn next(&self, _cancel: &CancelToken) -> Result<RawMessage> {
            let mut state = self.state.lock().expect("redelivering pool poisoned");
            match state.pending.pop_front() {
                Some(msg) => {
                    state.outstanding += 1;
                    Ok(msg)
                }
                None if state.outstanding == 0 => Err(Error::eof("redelivering_pool.next")),
                None => Err(Error::msg(
                    "redelivering_pool.next",
                    Severity::Runtime,
                    "no message ready, messages still in flight",
                )),
            }
        }

        fn done(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
            self.state.lock().expect("redelivering pool poisoned").outstanding -= 1;
            Ok(())
        }

        fn failed(&self, _cancel: &CancelToken, msg: &RawMessage) -> Result<()> {
            let mut state = self.state.lock().expect("redelivering pool poisoned");
            state.pending.push_back(msg.clone());
            state.outstanding -= 1;
            Ok(())
        }
    }

    /// Mirrors the literal S4 scenario: 100 messages across 5 workers, the
    /// handler panics on every 5th call it receives (by call count, not by
    /// message identity). A panicking call must surface as a `Runtime`
    /// error, not crash the worker thread, and the nacked message must be
    /// redelivered until it eventually succeeds.
    #[test]
    fn job_pool_survives_panics_and_redeliveries_until_all_succeed() {
        let total: usize = 100;
        let msgs = (0..total).map(|i| RawMessage::new(vec![i as u8])).collect();
        let pool: Arc<dyn MessagePool> = Arc::new(RedeliveringPool::new(msgs));

        struct PanicsEveryFifthCall {
            calls: AtomicUsize,
            successes: Arc<AtomicUsize>,
        }
        impl Handler for PanicsEveryFifthCall {
            fn handle(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n % 5 == 0 {
                    panic!("synthetic handler panic on call {}", n);
                }
                self.successes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let successes = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(PanicsEveryFifthCall {
            calls: AtomicUsize::new(0),
            successes: Arc::clone(&successes),
        });
        let engine = JobPoolEngine::new(pool, handler, 5, discard_logger());
        let cancel = CancelToken::new();
        engine.run(&cancel).unwrap();
        assert_eq!(successes.load(Ordering::SeqCst), total);
    }

    #[test]
    fn workers_observe_concurrent_execution() {
        use std::cell::Cell;
        use std::sync::Barrier;

        thread_local! {
            static WAITED: Cell<bool> = Cell::new(false);
        }

        let n_workers = 5;
        let barrier = Arc::new(Barrier::new(n_workers));
        let msgs = (0..n_workers * 4).map(|i| RawMessage::new(vec![i as u8])).collect();
        let pool: Arc<dyn MessagePool> = Arc::new(MockPool::new(msgs));

        struct BarrierHandler {
            barrier: Arc<Barrier>,
            hits: Arc<AtomicUsize>,
        }
        impl Handler for BarrierHandler {
            fn handle(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
                self.hits.fetch_add(1, Ordering::SeqCst);
                // Each worker thread waits on the barrier exactly once, on
                // the first message it ever handles: since the barrier only
                // releases once all `n_workers` threads have called `wait`,
                // this proves every worker is genuinely executing the
                // handler concurrently rather than one thread serially
                // draining the handoff channel.
                let already_waited = WAITED.with(|w| w.replace(true));
                if !already_waited {
                    self.barrier.wait();
                }
                Ok(())
            }
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(BarrierHandler {
            barrier: Arc::clone(&barrier),
            hits: Arc::clone(&hits),
        });
        let engine = JobPoolEngine::new(pool, handler, n_workers, discard_logger());
        let cancel = CancelToken::new();
        engine.run(&cancel).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), n_workers * 4);
    }
}
