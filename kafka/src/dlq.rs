use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord};

use ductwork_core::{CancelToken, Error, Result, Severity};
use ductwork_middleware::DlqProducer;

use crate::config::KafkaConfig;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Shelves failed payloads to a Kafka topic via a `FutureProducer`.
///
/// `publish` blocks the calling thread until delivery is confirmed, via
/// `futures_executor::block_on`: the engine's retry/DLQ middleware already
/// runs off its own worker thread, so there is no async runtime to hand the
/// future to.
pub struct KafkaDlqProducer {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDlqProducer {
    pub fn new(config: &KafkaConfig, topic: String) -> Result<KafkaDlqProducer> {
        let producer: FutureProducer = config
            .to_client_config()
            .create()
            .map_err(|e| Error::wrap("kafka_dlq.new", Severity::Fatal, e))?;
        Ok(KafkaDlqProducer { producer, topic })
    }
}

impl DlqProducer for KafkaDlqProducer {
    fn publish(&self, cancel: &CancelToken, payload: &[u8]) -> Result<()> {
        let _ = cancel;
        let record: FutureRecord<(), [u8]> = FutureRecord::to(&self.topic).payload(payload);
        let outcome = futures_executor::block_on(self.producer.send(record, DELIVERY_TIMEOUT));
        match outcome {
            Ok(_) => Ok(()),
            Err((err, _owned_message)) => {
                Err(Error::wrap("kafka_dlq.publish", Severity::Runtime, err).context("topic", self.topic.clone()))
            }
        }
    }

    /// Produces every payload asynchronously up front, then waits for all
    /// delivery confirmations, returning the first error encountered. This
    /// matches the reference source's batch DLQ publish, which fires every
    /// record before blocking on any single confirmation rather than
    /// confirming one payload before sending the next.
    fn publish_batch(&self, cancel: &CancelToken, payloads: &[Vec<u8>]) -> Result<()> {
        let _ = cancel;
        let sends = payloads.iter().map(|payload| {
            let record: FutureRecord<(), [u8]> = FutureRecord::to(&self.topic).payload(payload.as_slice());
            self.producer.send(record, DELIVERY_TIMEOUT)
        });
        let outcomes = futures_executor::block_on(futures::future::join_all(sends));
        let mut first_err = None;
        for outcome in outcomes {
            if let Err((err, _owned_message)) = outcome {
                if first_err.is_none() {
                    first_err = Some(
                        Error::wrap("kafka_dlq.publish_batch", Severity::Runtime, err)
                            .context("topic", self.topic.clone()),
                    );
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
