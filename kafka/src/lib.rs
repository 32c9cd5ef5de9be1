mod config;
mod dlq;
mod metrics;
mod request_controller;
mod stream;

pub use self::config::{KafkaConfig, SecurityProtocol};
pub use self::dlq::KafkaDlqProducer;
pub use self::request_controller::RequestController;
pub use self::stream::{KafkaStreamAdapter, KEY_HEADER};

/// Registers this crate's metrics with `registry`. Failures are logged and
/// otherwise ignored: a metrics collision must never stop the adapter from
/// running.
pub fn register_metrics(logger: &slog::Logger, registry: &prometheus::Registry) {
    self::metrics::register_metrics(logger, registry);
}
