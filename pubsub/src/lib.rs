mod config;
mod metrics;
mod pool;

pub use self::config::PubSubConfig;
pub use self::pool::PubSubPoolAdapter;

/// Registers this crate's metrics with `registry`. Failures are logged and
/// otherwise ignored: a metrics collision must never stop the adapter from
/// running.
pub fn register_metrics(logger: &slog::Logger, registry: &prometheus::Registry) {
    self::metrics::register_metrics(logger, registry);
}
