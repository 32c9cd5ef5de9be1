use std::time::Duration;

use rand::Rng;
use slog::{warn, Logger};

use ductwork_core::{CancelToken, Error, Result, Severity, Sink, SinkMessage};

/// Shape of the sink retrier's backoff.
///
/// Grounded on the reference source's `SinkWithRetry`: base backoff
/// doubling each attempt, plus a bounded random jitter, capped at a fixed
/// attempt count. Only `Runtime`-severity errors are retried.
#[derive(Clone, Copy, Debug)]
pub struct SinkRetryConfig {
    pub base_backoff: Duration,
    pub max_extra_jitter: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for SinkRetryConfig {
    fn default() -> SinkRetryConfig {
        SinkRetryConfig {
            base_backoff: Duration::from_secs(2),
            max_extra_jitter: Duration::from_millis(250),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Wraps a [`Sink`] with a bounded exponential-backoff retrier that retries
/// only `Runtime`-severity errors; any other severity (or cancellation) is
/// returned immediately without retrying.
pub struct SinkRetrier<S> {
    inner: S,
    config: SinkRetryConfig,
    logger: Logger,
}

impl<S: Sink> SinkRetrier<S> {
    pub fn new(inner: S, config: SinkRetryConfig, logger: Logger) -> SinkRetrier<S> {
        SinkRetrier {
            inner,
            config,
            logger,
        }
    }
}

impl<S: Sink> Sink for SinkRetrier<S> {
    fn store(&self, cancel: &CancelToken, msgs: &[SinkMessage]) -> Result<()> {
        let mut backoff = self.config.base_backoff;
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::cancelled("sink_retrier.store"));
            }

            let err = match self.inner.store(cancel, msgs) {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if err.severity() != Severity::Runtime {
                return Err(err);
            }

            attempt += 1;
            warn!(self.logger, "failed to send message batch to sink"; "attempt" => attempt, "error" => %err);
            if attempt >= self.config.max_attempts {
                return Err(err);
            }

            let jitter_millis = if self.config.max_extra_jitter.is_zero() {
                0
            } else {
                rand::thread_rng().gen_range(0..=self.config.max_extra_jitter.as_millis() as u64)
            };
            let sleep_for = backoff + Duration::from_millis(jitter_millis);
            if cancel.sleep(sleep_for) {
                return Err(Error::cancelled("sink_retrier.store"));
            }
            backoff = Duration::from_secs_f64(backoff.as_secs_f64() * self.config.multiplier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{Discard, Logger};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn discard_logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    fn fast_config(max_attempts: u32) -> SinkRetryConfig {
        SinkRetryConfig {
            base_backoff: Duration::from_millis(1),
            max_extra_jitter: Duration::from_millis(1),
            multiplier: 1.0,
            max_attempts,
        }
    }

    struct FlakySink {
        calls: Arc<AtomicUsize>,
        succeed_on: usize,
    }

    impl Sink for FlakySink {
        fn store(&self, _cancel: &CancelToken, _msgs: &[SinkMessage]) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.succeed_on {
                return Err(Error::msg("test.store", Severity::Runtime, "transient"));
            }
            Ok(())
        }
    }

    #[test]
    fn retries_runtime_errors_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink = SinkRetrier::new(
            FlakySink {
                calls: Arc::clone(&calls),
                succeed_on: 3,
            },
            fast_config(5),
            discard_logger(),
        );
        let cancel = CancelToken::new();
        sink.store(&cancel, &[]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    struct AlwaysRuntimeFailingSink;
    impl Sink for AlwaysRuntimeFailingSink {
        fn store(&self, _cancel: &CancelToken, _msgs: &[SinkMessage]) -> Result<()> {
            Err(Error::msg("test.store", Severity::Runtime, "down"))
        }
    }

    struct AlwaysInputFailingSink;
    impl Sink for AlwaysInputFailingSink {
        fn store(&self, _cancel: &CancelToken, _msgs: &[SinkMessage]) -> Result<()> {
            Err(Error::msg("test.store", Severity::Input, "bad key"))
        }
    }

    #[test]
    fn fails_permanently_after_max_attempts() {
        let sink = SinkRetrier::new(AlwaysRuntimeFailingSink, fast_config(3), discard_logger());
        let cancel = CancelToken::new();
        let err = sink.store(&cancel, &[]).unwrap_err();
        assert_eq!(err.severity(), Severity::Runtime);
    }

    #[test]
    fn non_runtime_errors_are_not_retried() {
        let sink = SinkRetrier::new(AlwaysInputFailingSink, fast_config(5), discard_logger());
        let cancel = CancelToken::new();
        let err = sink.store(&cancel, &[]).unwrap_err();
        assert_eq!(err.severity(), Severity::Input);
    }

    #[test]
    fn cancellation_is_observed_before_the_first_attempt() {
        let sink = SinkRetrier::new(AlwaysRuntimeFailingSink, fast_config(5), discard_logger());
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = sink.store(&cancel, &[]).unwrap_err();
        assert!(err.is_cancelled());
    }
}
