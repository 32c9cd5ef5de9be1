use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use slog::{debug, Logger};

lazy_static! {
    pub static ref PUBSUB_MESSAGES_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "ductwork_pubsub_messages_received_total",
            "Total number of messages delivered by the streaming-pull callback"
        ),
        &["subscription"]
    )
    .expect("failed to create PUBSUB_MESSAGES_RECEIVED_TOTAL counter");
    pub static ref PUBSUB_ACK_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "ductwork_pubsub_ack_errors_total",
            "Total number of failed ack/nack calls"
        ),
        &["subscription"]
    )
    .expect("failed to create PUBSUB_ACK_ERRORS_TOTAL counter");
    pub static ref PUBSUB_PENDING_MESSAGES: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "ductwork_pubsub_pending_messages",
            "Number of messages delivered but not yet acked or nacked"
        ),
        &["subscription"]
    )
    .expect("failed to create PUBSUB_PENDING_MESSAGES gauge");
}

/// Registers this module's metrics with `registry`. Failures are logged and
/// otherwise ignored.
pub fn register_metrics(logger: &Logger, registry: &Registry) {
    if let Err(err) = registry.register(Box::new(PUBSUB_MESSAGES_RECEIVED_TOTAL.clone())) {
        debug!(logger, "failed to register PUBSUB_MESSAGES_RECEIVED_TOTAL"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(PUBSUB_ACK_ERRORS_TOTAL.clone())) {
        debug!(logger, "failed to register PUBSUB_ACK_ERRORS_TOTAL"; "error" => ?err);
    }
    if let Err(err) = registry.register(Box::new(PUBSUB_PENDING_MESSAGES.clone())) {
        debug!(logger, "failed to register PUBSUB_PENDING_MESSAGES"; "error" => ?err);
    }
}
