//! In-memory `Stream`, `MessagePool` and `Sink` implementations used by this
//! crate's own tests and by downstream crates exercising engines and
//! middleware without a real broker.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::message::RawMessage;
use crate::pool::MessagePool;
use crate::sink::{Sink, SinkMessage};
use crate::stream::Stream;

/// A fixed, pre-loaded ordered sequence of messages, backing a single
/// [`Stream`]. `done` records how many messages have been committed rather
/// than doing anything observable externally; tests assert against
/// [`MockStream::committed`].
pub struct MockStream {
    pending: VecDeque<RawMessage>,
    emitted_since_done: usize,
    committed: usize,
    closed: bool,
}

impl MockStream {
    pub fn new(messages: Vec<RawMessage>) -> MockStream {
        MockStream {
            pending: messages.into(),
            emitted_since_done: 0,
            committed: 0,
            closed: false,
        }
    }

    /// Total number of messages acknowledged via `done` so far.
    pub fn committed(&self) -> usize {
        self.committed
    }
}

impl Stream for MockStream {
    fn next(&mut self, _cancel: &CancelToken) -> Result<RawMessage> {
        if self.closed {
            return Err(Error::eof("mock_stream.next"));
        }
        match self.pending.pop_front() {
            Some(msg) => {
                self.emitted_since_done += 1;
                Ok(msg)
            }
            None => Err(Error::eof("mock_stream.next")),
        }
    }

    fn done(&mut self, _cancel: &CancelToken) -> Result<()> {
        self.committed += self.emitted_since_done;
        self.emitted_since_done = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PoolAck {
    Done,
    Failed,
}

/// A fixed, pre-loaded unordered pool, backing a single [`MessagePool`].
/// `done`/`failed` calls are recorded in order for test assertions rather
/// than affecting redelivery, since nothing in this crate's test suite
/// needs a mock that actually redelivers failed messages.
pub struct MockPool {
    pending: Mutex<VecDeque<RawMessage>>,
    acks: Mutex<Vec<PoolAck>>,
}

impl MockPool {
    pub fn new(messages: Vec<RawMessage>) -> MockPool {
        MockPool {
            pending: Mutex::new(messages.into()),
            acks: Mutex::new(Vec::new()),
        }
    }

    pub fn acks(&self) -> Vec<PoolAck> {
        self.acks.lock().expect("mock pool poisoned").clone()
    }
}

impl MessagePool for MockPool {
    fn next(&self, _cancel: &CancelToken) -> Result<RawMessage> {
        let mut pending = self.pending.lock().expect("mock pool poisoned");
        match pending.pop_front() {
            Some(msg) => Ok(msg),
            None => Err(Error::eof("mock_pool.next")),
        }
    }

    fn done(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
        self.acks
            .lock()
            .expect("mock pool poisoned")
            .push(PoolAck::Done);
        Ok(())
    }

    fn failed(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
        self.acks
            .lock()
            .expect("mock pool poisoned")
            .push(PoolAck::Failed);
        Ok(())
    }
}

/// Collects every batch passed to `store` in memory for test assertions.
pub struct MockSink {
    stored: Mutex<Vec<SinkMessage>>,
}

impl MockSink {
    pub fn new() -> MockSink {
        MockSink {
            stored: Mutex::new(Vec::new()),
        }
    }

    pub fn stored(&self) -> Vec<SinkMessage> {
        self.stored.lock().expect("mock sink poisoned").clone()
    }
}

impl Default for MockSink {
    fn default() -> MockSink {
        MockSink::new()
    }
}

impl Sink for MockSink {
    fn store(&self, _cancel: &CancelToken, msgs: &[SinkMessage]) -> Result<()> {
        self.stored
            .lock()
            .expect("mock sink poisoned")
            .extend_from_slice(msgs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_stream_emits_in_order_then_eof() {
        let mut stream = MockStream::new(vec![
            RawMessage::new(b"1".to_vec()),
            RawMessage::new(b"2".to_vec()),
        ]);
        let cancel = CancelToken::new();
        assert_eq!(stream.next(&cancel).unwrap().payload(), b"1");
        assert_eq!(stream.next(&cancel).unwrap().payload(), b"2");
        assert!(stream.next(&cancel).unwrap_err().is_eof());
    }

    #[test]
    fn mock_stream_done_commits_emitted_batch() {
        let mut stream = MockStream::new(vec![
            RawMessage::new(b"1".to_vec()),
            RawMessage::new(b"2".to_vec()),
        ]);
        let cancel = CancelToken::new();
        stream.next(&cancel).unwrap();
        stream.next(&cancel).unwrap();
        assert_eq!(stream.committed(), 0);
        stream.done(&cancel).unwrap();
        assert_eq!(stream.committed(), 2);
    }

    #[test]
    fn mock_pool_records_acks() {
        let pool = MockPool::new(vec![RawMessage::new(b"1".to_vec())]);
        let cancel = CancelToken::new();
        let msg = pool.next(&cancel).unwrap();
        pool.done(&cancel, &msg).unwrap();
        assert_eq!(pool.acks(), vec![PoolAck::Done]);
    }
}
