use crate::cancel::CancelToken;
use crate::error::Result;
use crate::message::RawMessage;

/// An unordered set of in-flight messages, individually acknowledged.
///
/// Unlike [`crate::stream::Stream`], a `MessagePool` makes no ordering
/// promise and expects concurrent `next` calls from multiple workers to
/// return distinct messages — this is the contract a [`JobPoolEngine`]
/// relies on when it hands work to a pool of workers behind a single
/// poller.
///
/// [`JobPoolEngine`]: ../ductwork_engine/struct.JobPoolEngine.html
pub trait MessagePool: Send {
    /// Returns the next available message. Safe to call concurrently from
    /// multiple threads; each call returns a distinct message.
    fn next(&self, cancel: &CancelToken) -> Result<RawMessage>;

    /// Acknowledges `msg` as successfully processed. The source is free to
    /// discard it permanently. The result is advisory: engines log it at
    /// most, they never fail a run because `done` failed.
    fn done(&self, cancel: &CancelToken, msg: &RawMessage) -> Result<()>;

    /// Marks `msg` as failed, making the source eligible to redeliver it.
    /// Like `done`, the result is advisory only.
    fn failed(&self, cancel: &CancelToken, msg: &RawMessage) -> Result<()>;
}
