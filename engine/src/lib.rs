extern crate crossbeam_channel;
extern crate ductwork_core;
extern crate failure;
extern crate humthreads;
extern crate slog;

mod batch_stream_engine;
mod common;
mod job_pool_engine;
mod run_once_engine;
mod stream_engine;

pub use self::batch_stream_engine::BatchStreamEngine;
pub use self::common::{safe_handle, ProcessorError};
pub use self::job_pool_engine::JobPoolEngine;
pub use self::run_once_engine::RunOnceEngine;
pub use self::stream_engine::StreamEngine;
