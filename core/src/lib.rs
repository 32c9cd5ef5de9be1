extern crate crossbeam_channel;
extern crate failure;

mod cancel;
mod error;
mod handler;
mod health;
mod message;
mod pool;
mod sink;
mod stream;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use self::cancel::CancelToken;
pub use self::error::{Error, Result, Severity};
pub use self::handler::{BatchAsHandler, BatchHandler, Handler, HandlerAsBatch};
pub use self::health::{HealthCheck, HealthChecks, HealthResults, HealthStatus};
pub use self::message::RawMessage;
pub use self::pool::MessagePool;
pub use self::sink::{Sink, SinkMessage};
pub use self::stream::Stream;
