use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ductwork_core::{BatchHandler, CancelToken, Handler, HealthCheck, HealthStatus, RawMessage, Result};

/// Tracks the instant a handler last completed successfully, shared between
/// a wrapper that updates it and a [`StalenessProbe`] that reads it.
#[derive(Clone)]
pub struct Heartbeat {
    last_success: Arc<Mutex<Instant>>,
}

impl Heartbeat {
    pub fn new() -> Heartbeat {
        Heartbeat {
            last_success: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn touch(&self) {
        *self.last_success.lock().expect("heartbeat mutex poisoned") = Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.last_success.lock().expect("heartbeat mutex poisoned").elapsed()
    }
}

impl Default for Heartbeat {
    fn default() -> Heartbeat {
        Heartbeat::new()
    }
}

/// Reports `Failed` once no message has been processed successfully for
/// longer than `stale_after`.
///
/// A pipeline with no traffic at all is indistinguishable from a stuck one
/// by this probe alone; `Config::stale_after` should be set well above the
/// expected idle gaps between messages for whatever source feeds it.
pub struct StalenessProbe {
    heartbeat: Heartbeat,
    stale_after: Duration,
}

impl StalenessProbe {
    pub fn new(heartbeat: Heartbeat, stale_after: Duration) -> StalenessProbe {
        StalenessProbe {
            heartbeat,
            stale_after,
        }
    }
}

impl HealthCheck for StalenessProbe {
    fn check(&self) -> HealthStatus {
        let elapsed = self.heartbeat.elapsed();
        if elapsed > self.stale_after {
            HealthStatus::Failed(format!(
                "no successful message processed in {:.1}s (threshold {:.1}s)",
                elapsed.as_secs_f64(),
                self.stale_after.as_secs_f64()
            ))
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Wraps a [`Handler`], touching a shared [`Heartbeat`] on every success.
pub struct HeartbeatHandler<H> {
    inner: H,
    heartbeat: Heartbeat,
}

impl<H: Handler> HeartbeatHandler<H> {
    pub fn new(inner: H, heartbeat: Heartbeat) -> HeartbeatHandler<H> {
        HeartbeatHandler { inner, heartbeat }
    }
}

impl<H: Handler> Handler for HeartbeatHandler<H> {
    fn handle(&self, cancel: &CancelToken, msg: &RawMessage) -> Result<()> {
        let result = self.inner.handle(cancel, msg);
        if result.is_ok() {
            self.heartbeat.touch();
        }
        result
    }
}

/// Wraps a [`BatchHandler`], touching a shared [`Heartbeat`] once per
/// successful batch rather than once per message.
pub struct HeartbeatBatchHandler<B> {
    inner: B,
    heartbeat: Heartbeat,
}

impl<B: BatchHandler> HeartbeatBatchHandler<B> {
    pub fn new(inner: B, heartbeat: Heartbeat) -> HeartbeatBatchHandler<B> {
        HeartbeatBatchHandler { inner, heartbeat }
    }
}

impl<B: BatchHandler> BatchHandler for HeartbeatBatchHandler<B> {
    fn batch_handle(&self, cancel: &CancelToken, msgs: &[RawMessage]) -> Result<()> {
        let result = self.inner.batch_handle(cancel, msgs);
        if result.is_ok() {
            self.heartbeat.touch();
        }
        result
    }
}
