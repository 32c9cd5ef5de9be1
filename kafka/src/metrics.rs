use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use slog::{debug, Logger};

lazy_static! {
    pub static ref KAFKA_MESSAGES_POLLED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "ductwork_kafka_messages_polled_total",
            "Total number of messages received from the background poller"
        ),
        &["group_id"]
    )
    .expect("failed to create KAFKA_MESSAGES_POLLED_TOTAL counter");
    pub static ref KAFKA_COMMIT_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "ductwork_kafka_commit_errors_total",
            "Total number of failed offset commit attempts"
        ),
        &["group_id"]
    )
    .expect("failed to create KAFKA_COMMIT_ERRORS_TOTAL counter");
    pub static ref KAFKA_UNACKED_OFFSETS: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "ductwork_kafka_unacked_offsets",
            "Number of topic-partitions with an offset pending commit"
        ),
        &["group_id"]
    )
    .expect("failed to create KAFKA_UNACKED_OFFSETS gauge");
}

/// Registers this module's metrics with `registry`. Failures are logged and
/// otherwise ignored, matching the reference source's "best effort"
/// registration: a metrics collision must never stop the adapter from
/// running.
pub fn register_metrics(logger: &Logger, registry: &Registry) {
    if let Err(err) = registry.register(Box::new(KAFKA_MESSAGES_POLLED_TOTAL.clone())) {
        debug!(logger, "failed to register KAFKA_MESSAGES_POLLED_TOTAL"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(KAFKA_COMMIT_ERRORS_TOTAL.clone())) {
        debug!(logger, "failed to register KAFKA_COMMIT_ERRORS_TOTAL"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(KAFKA_UNACKED_OFFSETS.clone())) {
        debug!(logger, "failed to register KAFKA_UNACKED_OFFSETS"; "error" => ?err);
    }
}
