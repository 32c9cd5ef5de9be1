use crate::cancel::CancelToken;
use crate::error::Result;
use crate::message::RawMessage;

/// User-supplied business logic for a single message.
///
/// Returning `Ok(())` means the message was successfully processed.
/// Returning an error whose severity is `Fatal` aborts the owning engine;
/// any other error is retried according to the engine's policy (directly
/// or through the backoff/DLQ middleware stack).
pub trait Handler: Send + Sync {
    fn handle(&self, cancel: &CancelToken, msg: &RawMessage) -> Result<()>;
}

/// User-supplied business logic for a batch of messages, processed
/// atomically: the whole batch succeeds or the whole batch fails together.
pub trait BatchHandler: Send + Sync {
    fn batch_handle(&self, cancel: &CancelToken, msgs: &[RawMessage]) -> Result<()>;
}

/// Adapts a single-message [`Handler`] into a [`BatchHandler`] by invoking
/// it once per message in order, short-circuiting the batch on the first
/// error.
///
/// Used by [`BatchStreamEngine`] when the caller supplies a `Handler`
/// rather than writing a true batch-aware `BatchHandler`.
///
/// [`BatchStreamEngine`]: ../ductwork_engine/struct.BatchStreamEngine.html
pub struct HandlerAsBatch<H> {
    inner: H,
}

impl<H: Handler> HandlerAsBatch<H> {
    pub fn new(inner: H) -> HandlerAsBatch<H> {
        HandlerAsBatch { inner }
    }
}

impl<H: Handler> BatchHandler for HandlerAsBatch<H> {
    fn batch_handle(&self, cancel: &CancelToken, msgs: &[RawMessage]) -> Result<()> {
        for msg in msgs {
            self.inner.handle(cancel, msg)?;
        }
        Ok(())
    }
}

/// Adapts a [`BatchHandler`] into a [`Handler`] by wrapping each single
/// message in a one-element batch.
///
/// Used by engines that only know how to drive single messages (e.g.
/// [`StreamEngine`], [`JobPoolEngine`]) when the caller supplies a
/// `BatchHandler`.
///
/// [`StreamEngine`]: ../ductwork_engine/struct.StreamEngine.html
/// [`JobPoolEngine`]: ../ductwork_engine/struct.JobPoolEngine.html
pub struct BatchAsHandler<B> {
    inner: B,
}

impl<B: BatchHandler> BatchAsHandler<B> {
    pub fn new(inner: B) -> BatchAsHandler<B> {
        BatchAsHandler { inner }
    }
}

impl<B: BatchHandler> Handler for BatchAsHandler<B> {
    fn handle(&self, cancel: &CancelToken, msg: &RawMessage) -> Result<()> {
        self.inner.batch_handle(cancel, std::slice::from_ref(msg))
    }
}
