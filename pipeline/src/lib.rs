extern crate ductwork_core;
extern crate ductwork_engine;
extern crate ductwork_kafka;
extern crate ductwork_middleware;
extern crate ductwork_pubsub;
extern crate slog;

mod config;
mod health;
mod lifecycle;
mod metrics;

pub use self::config::{BackoffSettings, Config, DlqSettings, EngineMode, InputConfig, SinkRetrySettings};
pub use self::health::{Heartbeat, HeartbeatBatchHandler, HeartbeatHandler, StalenessProbe};
pub use self::lifecycle::{Pipeline, RunnableEngine};
pub use self::metrics::{MetricsBatchHandler, MetricsHandler};

use std::sync::Arc;

use slog::Logger;

use ductwork_core::{BatchHandler, HandlerAsBatch, HealthChecks, Handler, RawMessage, Result, Stream};
use ductwork_engine::{BatchStreamEngine, JobPoolEngine, RunOnceEngine, StreamEngine};
use ductwork_kafka::{KafkaDlqProducer, KafkaStreamAdapter};
use ductwork_middleware::{BackoffBatchHandler, BackoffHandler, DlqBatchHandler, DlqHandler, DlqProducer, SinkRetrier, TimeoutHandler};
use ductwork_pubsub::PubSubPoolAdapter;

/// Registers every crate's metrics with `registry`. Downstream binaries
/// call this once at startup rather than wiring each crate's
/// `register_metrics` individually.
pub fn register_metrics(logger: &Logger, registry: &prometheus::Registry) {
    self::metrics::register_metrics(logger, registry);
    ductwork_kafka::register_metrics(logger, registry);
    ductwork_pubsub::register_metrics(logger, registry);
}

/// Wraps a handler with this crate's full single-message middleware stack,
/// innermost to outermost: backoff, timeout, DLQ, heartbeat, metrics.
///
/// Timeout wraps backoff, not the reverse: the deadline bounds the whole
/// retry sequence for one message, so a single slow attempt is retried
/// rather than immediately surfacing as a fatal timeout. Only a cumulative
/// overrun across retries is fatal.
///
/// `dlq_producer: None` (or `config.dlq.noop`) makes the DLQ stage a no-op:
/// failures exhausted by backoff/timeout are logged and dropped rather than
/// shelved anywhere.
pub fn wrap_handler<H: Handler + 'static>(
    inner: H,
    config: &Config,
    dlq_producer: Option<Arc<dyn DlqProducer>>,
    heartbeat: Heartbeat,
    system: impl Into<String>,
    logger: Logger,
) -> Arc<dyn Handler> {
    let system = system.into();
    let producer = if config.dlq.noop { None } else { dlq_producer };

    if let Some(timeout) = config.processing_timeout() {
        let backed_off = BackoffHandler::new(inner, config.backoff.to_backoff_config());
        let timed = TimeoutHandler::new(backed_off, timeout);
        let dlq = DlqHandler::new(timed, producer, logger);
        let beat = HeartbeatHandler::new(dlq, heartbeat);
        Arc::new(MetricsHandler::new(beat, system))
    } else {
        let backed_off = BackoffHandler::new(inner, config.backoff.to_backoff_config());
        let dlq = DlqHandler::new(backed_off, producer, logger);
        let beat = HeartbeatHandler::new(dlq, heartbeat);
        Arc::new(MetricsHandler::new(beat, system))
    }
}

/// Batch counterpart of [`wrap_handler`]. There is no batch `TimeoutHandler`
/// in this crate's middleware stack: a processing timeout for a batch
/// engine should be enforced by the caller's own handler if it needs one,
/// since "the batch took too long" and "message N took too long" are not
/// the same failure.
pub fn wrap_batch_handler<B: BatchHandler + 'static>(
    inner: B,
    config: &Config,
    dlq_producer: Option<Arc<dyn DlqProducer>>,
    heartbeat: Heartbeat,
    system: impl Into<String>,
    logger: Logger,
) -> Arc<dyn BatchHandler> {
    let system = system.into();
    let producer = if config.dlq.noop { None } else { dlq_producer };
    let backed_off = BackoffBatchHandler::new(inner, config.backoff.to_backoff_config());
    let dlq = DlqBatchHandler::new(backed_off, producer, logger);
    let beat = HeartbeatBatchHandler::new(dlq, heartbeat);
    Arc::new(MetricsBatchHandler::new(beat, system))
}

/// Wraps a [`ductwork_core::Sink`] with this crate's sink retrier, so a
/// transient destination failure is retried before surfacing to the
/// engine that owns the batch being stored.
pub fn wrap_sink<S: ductwork_core::Sink>(inner: S, config: &Config, logger: Logger) -> SinkRetrier<S> {
    SinkRetrier::new(inner, config.sink_retry.to_sink_retry_config(), logger)
}

/// Builds the Kafka DLQ producer this pipeline's config calls for, or
/// `None` if the DLQ is configured as a no-op or the input isn't Kafka.
///
/// A Pub/Sub input with a configured DLQ topic still needs *some* durable
/// publish target; this crate only ships a Kafka-backed `DlqProducer`, so
/// that combination requires the caller to supply their own
/// `Arc<dyn DlqProducer>` instead of relying on this helper.
pub fn build_kafka_dlq_producer(config: &Config) -> Result<Option<Arc<dyn DlqProducer>>> {
    if config.dlq.noop {
        return Ok(None);
    }
    let topic = match &config.dlq.topic {
        Some(topic) => topic.clone(),
        None => return Ok(None),
    };
    let kafka_config = match &config.input {
        InputConfig::Kafka(kafka) => kafka,
        InputConfig::PubSub(_) => return Ok(None),
    };
    let producer = KafkaDlqProducer::new(kafka_config, topic)?;
    Ok(Some(Arc::new(producer)))
}

/// Builds the engine this pipeline's config calls for, already wired to
/// its source and to `handler` wrapped through [`wrap_handler`] (and
/// [`wrap_batch_handler`] when `engine_mode` needs a `BatchHandler`).
///
/// Returns the health checks the engine's source contributes (currently
/// just a [`StalenessProbe`] tied to `heartbeat`) alongside the engine
/// itself, so the caller can fold them into its own `HealthChecks`
/// registry next to whatever else it exposes.
pub fn build_engine<H: Handler + 'static>(
    config: &Config,
    handler: H,
    dlq_producer: Option<Arc<dyn DlqProducer>>,
    logger: Logger,
) -> Result<(Box<dyn RunnableEngine>, HealthChecks)> {
    let heartbeat = Heartbeat::new();
    let mut checks = HealthChecks::new();
    checks.register("staleness", StalenessProbe::new(heartbeat.clone(), config.stale_after()));

    let engine: Box<dyn RunnableEngine> = match &config.input {
        InputConfig::PubSub(pubsub_config) => {
            let pool = Arc::new(PubSubPoolAdapter::new(pubsub_config, logger.clone())?);
            let wrapped = wrap_handler(handler, config, dlq_producer, heartbeat, config.system_name.as_str(), logger.clone());
            Box::new(JobPoolEngine::new(pool, wrapped, config.n_workers, logger))
        }
        InputConfig::Kafka(kafka_config) => {
            let stream: Box<dyn Stream> = Box::new(KafkaStreamAdapter::new(kafka_config, logger.clone())?);
            match config.engine_mode {
                EngineMode::Stream => {
                    let wrapped = wrap_handler(handler, config, dlq_producer, heartbeat, config.system_name.as_str(), logger.clone());
                    Box::new(StreamEngine::new(vec![stream], wrapped, logger))
                }
                EngineMode::BatchStream => {
                    let batch = HandlerAsBatch::new(handler);
                    let wrapped = wrap_batch_handler(batch, config, dlq_producer, heartbeat, config.system_name.as_str(), logger.clone());
                    Box::new(BatchStreamEngine::new(
                        vec![stream],
                        wrapped,
                        config.batch_size,
                        config.batch_timeout(),
                        logger,
                    ))
                }
                EngineMode::RunOnce => {
                    let batch = HandlerAsBatch::new(handler);
                    let wrapped = wrap_batch_handler(batch, config, dlq_producer, heartbeat, config.system_name.as_str(), logger.clone());
                    Box::new(RunOnceEngine::new(
                        stream,
                        Box::new(BatchAsHandlerAdapter(wrapped)),
                        config.batch_size,
                        config.batch_timeout(),
                        logger,
                    ))
                }
            }
        }
    };

    Ok((engine, checks))
}

/// Bridges an `Arc<dyn BatchHandler>` into the owned `Box<dyn BatchHandler>`
/// `RunOnceEngine::new` expects, without an extra `Handler`-via-`BatchAsHandler`
/// round trip.
struct BatchAsHandlerAdapter(Arc<dyn BatchHandler>);

impl BatchHandler for BatchAsHandlerAdapter {
    fn batch_handle(&self, cancel: &ductwork_core::CancelToken, msgs: &[RawMessage]) -> Result<()> {
        self.0.batch_handle(cancel, msgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ductwork_core::{CancelToken, Error, Severity};
    use slog::{Discard, Logger};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn discard_logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    #[derive(Clone)]
    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    impl Handler for CountingHandler {
        fn handle(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn wrap_handler_reports_success_through_every_layer() {
        let config = Config {
            system_name: "test".to_string(),
            input: InputConfig::PubSub(ductwork_pubsub::PubSubConfig::default()),
            engine_mode: EngineMode::Stream,
            batch_size: 1,
            batch_timeout_ms: 1000,
            processing_timeout_ms: 0,
            n_workers: 1,
            backoff: BackoffSettings::default(),
            dlq: DlqSettings::default(),
            sink_retry: SinkRetrySettings::default(),
            stale_after_ms: 60_000,
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = CountingHandler { calls: Arc::clone(&calls) };
        let heartbeat = Heartbeat::new();
        let wrapped = wrap_handler(handler, &config, None, heartbeat, "test", discard_logger());
        let cancel = CancelToken::new();
        wrapped.handle(&cancel, &RawMessage::new(b"x".to_vec())).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Clone)]
    struct AlwaysFailsInput;
    impl Handler for AlwaysFailsInput {
        fn handle(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
            Err(Error::msg("test.handle", Severity::Input, "bad payload"))
        }
    }

    #[test]
    fn wrap_handler_noop_dlq_drops_exhausted_failures() {
        let config = Config {
            system_name: "test".to_string(),
            input: InputConfig::PubSub(ductwork_pubsub::PubSubConfig::default()),
            engine_mode: EngineMode::Stream,
            batch_size: 1,
            batch_timeout_ms: 1000,
            processing_timeout_ms: 0,
            n_workers: 1,
            backoff: BackoffSettings {
                initial_delay_ms: 1,
                max_delay_ms: 2,
                spread: 0.0,
                factor: 1.0,
                max_retries: 0,
            },
            dlq: DlqSettings { topic: None, noop: true },
            sink_retry: SinkRetrySettings::default(),
            stale_after_ms: 60_000,
        };
        let heartbeat = Heartbeat::new();
        let wrapped = wrap_handler(AlwaysFailsInput, &config, None, heartbeat, "test", discard_logger());
        let cancel = CancelToken::new();
        wrapped.handle(&cancel, &RawMessage::new(b"x".to_vec())).unwrap();
    }
}
