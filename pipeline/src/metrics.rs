use lazy_static::lazy_static;
use prometheus::{IntCounterVec, Opts, Registry};
use slog::{debug, Logger};

use ductwork_core::{BatchHandler, CancelToken, Handler, RawMessage, Result};

lazy_static! {
    pub static ref PIPELINE_MESSAGES_PROCESSED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "ductwork_pipeline_messages_processed_total",
            "Total number of messages successfully handled"
        ),
        &["system"]
    )
    .expect("failed to create PIPELINE_MESSAGES_PROCESSED_TOTAL counter");
    pub static ref PIPELINE_MESSAGES_FAILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "ductwork_pipeline_messages_failed_total",
            "Total number of messages that failed handling (before any DLQ/retry middleware runs)"
        ),
        &["system"]
    )
    .expect("failed to create PIPELINE_MESSAGES_FAILED_TOTAL counter");
}

/// Registers this module's metrics with `registry`. Failures are logged and
/// otherwise ignored: a metrics collision must never stop a pipeline from
/// running.
pub fn register_metrics(logger: &Logger, registry: &Registry) {
    if let Err(err) = registry.register(Box::new(PIPELINE_MESSAGES_PROCESSED_TOTAL.clone())) {
        debug!(logger, "failed to register PIPELINE_MESSAGES_PROCESSED_TOTAL"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(PIPELINE_MESSAGES_FAILED_TOTAL.clone())) {
        debug!(logger, "failed to register PIPELINE_MESSAGES_FAILED_TOTAL"; "error" => ?err);
    }
}

/// Wraps a [`Handler`], counting successes and failures against the
/// `system` label. Sits outermost in the middleware stack (after backoff
/// and DLQ) so a "failure" here means the whole retry policy was
/// exhausted or the error was fatal, not a single retried attempt.
pub struct MetricsHandler<H> {
    inner: H,
    system: String,
}

impl<H: Handler> MetricsHandler<H> {
    pub fn new(inner: H, system: impl Into<String>) -> MetricsHandler<H> {
        MetricsHandler {
            inner,
            system: system.into(),
        }
    }
}

impl<H: Handler> Handler for MetricsHandler<H> {
    fn handle(&self, cancel: &CancelToken, msg: &RawMessage) -> Result<()> {
        let result = self.inner.handle(cancel, msg);
        match &result {
            Ok(()) => PIPELINE_MESSAGES_PROCESSED_TOTAL.with_label_values(&[&self.system]).inc(),
            Err(_) => PIPELINE_MESSAGES_FAILED_TOTAL.with_label_values(&[&self.system]).inc(),
        }
        result
    }
}

/// Batch counterpart of [`MetricsHandler`]: counts the batch as one unit,
/// incremented by the batch's size on success.
pub struct MetricsBatchHandler<B> {
    inner: B,
    system: String,
}

impl<B: BatchHandler> MetricsBatchHandler<B> {
    pub fn new(inner: B, system: impl Into<String>) -> MetricsBatchHandler<B> {
        MetricsBatchHandler {
            inner,
            system: system.into(),
        }
    }
}

impl<B: BatchHandler> BatchHandler for MetricsBatchHandler<B> {
    fn batch_handle(&self, cancel: &CancelToken, msgs: &[RawMessage]) -> Result<()> {
        let result = self.inner.batch_handle(cancel, msgs);
        match &result {
            Ok(()) => PIPELINE_MESSAGES_PROCESSED_TOTAL
                .with_label_values(&[&self.system])
                .inc_by(msgs.len() as u64),
            Err(_) => PIPELINE_MESSAGES_FAILED_TOTAL.with_label_values(&[&self.system]).inc(),
        }
        result
    }
}
