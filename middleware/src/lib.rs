extern crate ductwork_core;
extern crate rand;
extern crate slog;

mod backoff;
mod dlq;
mod sink_retry;
mod timeout;

pub use self::backoff::{BackoffBatchHandler, BackoffConfig, BackoffHandler};
pub use self::dlq::{DlqBatchHandler, DlqHandler, DlqProducer};
pub use self::sink_retry::{SinkRetryConfig, SinkRetrier};
pub use self::timeout::TimeoutHandler;
