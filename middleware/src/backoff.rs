use std::time::Duration;

use rand::Rng;

use ductwork_core::{BatchHandler, CancelToken, Error, Handler, RawMessage, Result, Severity};

/// Shape of the exponential backoff applied between retries.
///
/// Grounded on the reference source's `BackoffConfig`/`DefaultBackoffConfig`:
/// each failure sleeps `delay + uniform(0, delay * spread)`, then `delay` is
/// multiplied by `factor` and clamped to `max_delay`.
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub spread: f64,
    pub factor: f64,
    /// Maximum number of retries after the first attempt, or `-1` for no
    /// limit. When the limit is reached the last error observed is
    /// returned instead of retrying again.
    pub max_retries: i64,
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            spread: 0.2,
            factor: 1.5,
            max_retries: -1,
        }
    }
}

fn spread_delay(delay: Duration, spread: f64) -> Duration {
    if spread <= 0.0 {
        return delay;
    }
    let extra_nanos = (delay.as_nanos() as f64 * spread).max(1.0);
    let extra = rand::thread_rng().gen_range(0.0..extra_nanos);
    delay + Duration::from_nanos(extra as u64)
}

/// Runs `attempt` until it succeeds, a `Fatal` error surfaces, cancellation
/// is observed, or `config.max_retries` is exhausted.
fn run_with_backoff<F>(cancel: &CancelToken, config: &BackoffConfig, mut attempt: F) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    let mut delay = config.initial_delay;
    let mut retries: i64 = 0;
    loop {
        match attempt() {
            Ok(()) => return Ok(()),
            Err(err) => {
                if err.severity() == Severity::Fatal || err.is_cancelled() {
                    return Err(err);
                }
                if cancel.is_cancelled() {
                    return Err(Error::cancelled("backoff.run_with_backoff"));
                }
                if config.max_retries >= 0 && retries >= config.max_retries {
                    return Err(err);
                }

                let sleep_for = spread_delay(delay, config.spread);
                if cancel.sleep(sleep_for) {
                    return Err(Error::cancelled("backoff.run_with_backoff"));
                }

                delay = Duration::from_secs_f64(delay.as_secs_f64() * config.factor);
                if delay > config.max_delay {
                    delay = config.max_delay;
                }
                retries += 1;
            }
        }
    }
}

/// Wraps a [`Handler`] with exponential backoff between retries.
pub struct BackoffHandler<H> {
    inner: H,
    config: BackoffConfig,
}

impl<H: Handler> BackoffHandler<H> {
    pub fn new(inner: H, config: BackoffConfig) -> BackoffHandler<H> {
        BackoffHandler { inner, config }
    }
}

impl<H: Handler> Handler for BackoffHandler<H> {
    fn handle(&self, cancel: &CancelToken, msg: &RawMessage) -> Result<()> {
        run_with_backoff(cancel, &self.config, || self.inner.handle(cancel, msg))
    }
}

/// Wraps a [`BatchHandler`] with exponential backoff between retries.
pub struct BackoffBatchHandler<B> {
    inner: B,
    config: BackoffConfig,
}

impl<B: BatchHandler> BackoffBatchHandler<B> {
    pub fn new(inner: B, config: BackoffConfig) -> BackoffBatchHandler<B> {
        BackoffBatchHandler { inner, config }
    }
}

impl<B: BatchHandler> BatchHandler for BackoffBatchHandler<B> {
    fn batch_handle(&self, cancel: &CancelToken, msgs: &[RawMessage]) -> Result<()> {
        run_with_backoff(cancel, &self.config, || self.inner.batch_handle(cancel, msgs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    struct FlakyHandler {
        calls: Arc<AtomicUsize>,
        succeed_on: usize,
    }

    impl Handler for FlakyHandler {
        fn handle(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.succeed_on {
                return Err(Error::msg("test.handle", Severity::Runtime, "not yet"));
            }
            Ok(())
        }
    }

    #[test]
    fn retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = BackoffHandler::new(
            FlakyHandler {
                calls: Arc::clone(&calls),
                succeed_on: 3,
            },
            BackoffConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                spread: 0.1,
                factor: 1.2,
                max_retries: -1,
            },
        );
        let cancel = CancelToken::new();
        handler
            .handle(&cancel, &RawMessage::new(b"x".to_vec()))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    struct AlwaysFailsHandler;
    impl Handler for AlwaysFailsHandler {
        fn handle(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
            Err(Error::msg("test.handle", Severity::Runtime, "nope"))
        }
    }

    #[test]
    fn gives_up_after_max_retries() {
        let handler = BackoffHandler::new(
            AlwaysFailsHandler,
            BackoffConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                spread: 0.0,
                factor: 1.0,
                max_retries: 3,
            },
        );
        let cancel = CancelToken::new();
        let err = handler
            .handle(&cancel, &RawMessage::new(b"x".to_vec()))
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    struct FatalHandler;
    impl Handler for FatalHandler {
        fn handle(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
            Err(Error::msg("test.handle", Severity::Fatal, "boom"))
        }
    }

    #[test]
    fn fatal_errors_bypass_retry() {
        let handler = BackoffHandler::new(FatalHandler, BackoffConfig::default());
        let cancel = CancelToken::new();
        let err = handler
            .handle(&cancel, &RawMessage::new(b"x".to_vec()))
            .unwrap_err();
        assert_eq!(err.severity(), Severity::Fatal);
    }

    #[test]
    fn cancellation_interrupts_the_sleep() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(BackoffHandler::new(
            FlakyHandler {
                calls: Arc::clone(&calls),
                succeed_on: 1_000_000,
            },
            BackoffConfig {
                initial_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(5),
                spread: 0.0,
                factor: 1.0,
                max_retries: -1,
            },
        ));
        let cancel = CancelToken::new();
        let thread_handler = Arc::clone(&handler);
        let thread_cancel = cancel.clone();
        let join = thread::spawn(move || {
            thread_handler.handle(&thread_cancel, &RawMessage::new(b"x".to_vec()))
        });
        thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        let result = join.join().unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }
}
