use std::sync::Arc;

use slog::{info, warn, Logger};

use ductwork_core::{BatchHandler, CancelToken, Handler, RawMessage, Result, Severity};

/// A durable publish target for messages a handler could not process.
///
/// Implementations must not return `Ok` until delivery is confirmed by the
/// destination (e.g. a Kafka producer configured for synchronous delivery
/// confirmation): [`DlqHandler`]/[`DlqBatchHandler`] return `Ok` to the
/// engine once `publish`/`publish_batch` succeeds, which causes the engine
/// to commit the source offset — "shelved to the DLQ" only means something
/// if the shelving itself is durable.
pub trait DlqProducer: Send + Sync {
    fn publish(&self, cancel: &CancelToken, payload: &[u8]) -> Result<()>;

    /// Publishes every payload, waiting for all of them to be confirmed.
    /// The default sequential implementation is correct but slow;
    /// producers that can fan out delivery confirmation (as the Kafka
    /// adapter does) should override this.
    fn publish_batch(&self, cancel: &CancelToken, payloads: &[Vec<u8>]) -> Result<()> {
        for payload in payloads {
            self.publish(cancel, payload)?;
        }
        Ok(())
    }
}

/// Wraps a [`Handler`]: on a non-fatal, non-cancelled failure, shelves the
/// original message to a dead-letter destination instead of leaving it to
/// the engine's own retry loop.
pub struct DlqHandler<H> {
    inner: H,
    producer: Option<Arc<dyn DlqProducer>>,
    logger: Logger,
}

impl<H: Handler> DlqHandler<H> {
    /// `producer: None` means the DLQ is configured as a no-op: failed
    /// messages are logged and dropped rather than published anywhere.
    pub fn new(inner: H, producer: Option<Arc<dyn DlqProducer>>, logger: Logger) -> DlqHandler<H> {
        DlqHandler {
            inner,
            producer,
            logger,
        }
    }
}

impl<H: Handler> Handler for DlqHandler<H> {
    fn handle(&self, cancel: &CancelToken, msg: &RawMessage) -> Result<()> {
        let err = match self.inner.handle(cancel, msg) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if err.severity() == Severity::Fatal || err.is_cancelled() {
            return Err(err);
        }

        match &self.producer {
            None => {
                info!(self.logger, "dropping failed message, DLQ is configured as no-op"; "error" => %err);
                Ok(())
            }
            Some(producer) => {
                warn!(self.logger, "shelving failed message to DLQ"; "error" => %err);
                producer
                    .publish(cancel, msg.payload())
                    .map_err(|e| e.push_op("dlq.handle"))
            }
        }
    }
}

/// Batch counterpart of [`DlqHandler`].
pub struct DlqBatchHandler<B> {
    inner: B,
    producer: Option<Arc<dyn DlqProducer>>,
    logger: Logger,
}

impl<B: BatchHandler> DlqBatchHandler<B> {
    pub fn new(inner: B, producer: Option<Arc<dyn DlqProducer>>, logger: Logger) -> DlqBatchHandler<B> {
        DlqBatchHandler {
            inner,
            producer,
            logger,
        }
    }
}

impl<B: BatchHandler> BatchHandler for DlqBatchHandler<B> {
    fn batch_handle(&self, cancel: &CancelToken, msgs: &[RawMessage]) -> Result<()> {
        let err = match self.inner.batch_handle(cancel, msgs) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if err.severity() == Severity::Fatal || err.is_cancelled() {
            return Err(err);
        }

        match &self.producer {
            None => {
                info!(self.logger, "dropping failed batch, DLQ is configured as no-op"; "size" => msgs.len(), "error" => %err);
                Ok(())
            }
            Some(producer) => {
                warn!(self.logger, "shelving failed batch to DLQ"; "size" => msgs.len(), "error" => %err);
                let payloads: Vec<Vec<u8>> = msgs.iter().map(|m| m.payload().to_vec()).collect();
                producer
                    .publish_batch(cancel, &payloads)
                    .map_err(|e| e.push_op("dlq.batch_handle"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ductwork_core::Error;
    use slog::{Discard, Logger};
    use std::sync::Mutex;

    fn discard_logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    struct FailingHandler;
    impl Handler for FailingHandler {
        fn handle(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
            Err(Error::msg("test.handle", Severity::Input, "bad payload"))
        }
    }

    struct RecordingProducer {
        published: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingProducer {
        fn new() -> RecordingProducer {
            RecordingProducer {
                published: Mutex::new(Vec::new()),
            }
        }
    }

    impl DlqProducer for RecordingProducer {
        fn publish(&self, _cancel: &CancelToken, payload: &[u8]) -> Result<()> {
            self.published.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    #[test]
    fn non_fatal_failure_is_shelved_and_handler_reports_success() {
        let producer = Arc::new(RecordingProducer::new());
        let handler = DlqHandler::new(FailingHandler, Some(producer.clone()), discard_logger());
        let cancel = CancelToken::new();
        let msg = RawMessage::new(b"payload".to_vec());
        handler.handle(&cancel, &msg).unwrap();
        assert_eq!(producer.published.lock().unwrap().as_slice(), &[b"payload".to_vec()]);
    }

    #[test]
    fn noop_dlq_drops_message_and_reports_success() {
        let handler = DlqHandler::new(FailingHandler, None, discard_logger());
        let cancel = CancelToken::new();
        handler.handle(&cancel, &RawMessage::new(b"x".to_vec())).unwrap();
    }

    struct FatalHandler;
    impl Handler for FatalHandler {
        fn handle(&self, _cancel: &CancelToken, _msg: &RawMessage) -> Result<()> {
            Err(Error::msg("test.handle", Severity::Fatal, "boom"))
        }
    }

    #[test]
    fn fatal_errors_are_not_shelved() {
        let producer = Arc::new(RecordingProducer::new());
        let handler = DlqHandler::new(FatalHandler, Some(producer.clone()), discard_logger());
        let cancel = CancelToken::new();
        let err = handler
            .handle(&cancel, &RawMessage::new(b"x".to_vec()))
            .unwrap_err();
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(producer.published.lock().unwrap().is_empty());
    }
}
