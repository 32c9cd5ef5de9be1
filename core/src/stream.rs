use crate::cancel::CancelToken;
use crate::error::Result;
use crate::message::RawMessage;

/// An ordered message sequence bound to one logical partition (e.g. one
/// Kafka topic-partition).
///
/// Messages returned by [`Stream::next`] are monotonically ordered.
/// [`Stream::done`] acknowledges every message emitted since the previous
/// `done` call (commit-prefix semantics) — it does not take a message
/// argument, unlike [`crate::pool::MessagePool::done`]. After [`Stream::close`],
/// `next` fails with the end-of-input sentinel ([`crate::error::Error::eof`])
/// forever.
///
/// Implementations need only be safe for a single reader: one engine worker
/// owns and polls one `Stream` instance for its whole lifetime.
pub trait Stream: Send {
    /// Returns the next message in order, or the end-of-input sentinel
    /// once the stream is exhausted or closed. A crash or cancellation
    /// between `next` and the following `done` may cause redelivery on
    /// restart: this is the at-least-once guarantee, not a bug.
    fn next(&mut self, cancel: &CancelToken) -> Result<RawMessage>;

    /// Commits every message emitted by `next` since the last `done` call.
    /// Failure is surfaced to the caller but is not inherently fatal unless
    /// the underlying error is classified as such.
    fn done(&mut self, cancel: &CancelToken) -> Result<()>;

    /// Releases any resources held by this stream. After `close`, every
    /// subsequent `next` call returns the end-of-input sentinel.
    fn close(&mut self) -> Result<()>;
}
