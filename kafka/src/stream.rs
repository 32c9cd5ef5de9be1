use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use humthreads::{Builder as ThreadBuilder, JoinHandle};
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, DefaultConsumerContext};
use rdkafka::message::{Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use slog::{debug, warn, Logger};

use ductwork_core::{CancelToken, Error, RawMessage, Result, Severity, Stream};

use crate::config::KafkaConfig;
use crate::metrics::{KAFKA_COMMIT_ERRORS_TOTAL, KAFKA_MESSAGES_POLLED_TOTAL, KAFKA_UNACKED_OFFSETS};
use crate::request_controller::RequestController;

/// Metadata key an adapter-built `RawMessage` carries the original Kafka
/// record key under, alongside every broker header already present on the
/// record.
pub const KEY_HEADER: &str = "ductwork.key";

type StatsConsumer = BaseConsumer<DefaultConsumerContext>;

/// Bridges a single `rdkafka` consumer to the [`Stream`] contract.
///
/// Owns one consumer, subscribed at construction, and one background
/// polling thread driving it through a [`RequestController`] so that the
/// SDK's blocking read can be cancelled cleanly from `next`. Tracks the
/// highest offset seen per topic-partition and commits `offset + 1` for
/// each on `done`, matching the reference source's commit-prefix contract.
pub struct KafkaStreamAdapter {
    controller: Arc<RequestController>,
    unacked: Arc<Mutex<HashMap<(String, i32), i64>>>,
    group_id: String,
    disable_commit: bool,
    consumer: Arc<StatsConsumer>,
    poller: Option<JoinHandle<()>>,
    closed: bool,
}

impl KafkaStreamAdapter {
    pub fn new(config: &KafkaConfig, logger: Logger) -> Result<KafkaStreamAdapter> {
        let consumer: StatsConsumer = config
            .to_client_config()
            .create()
            .map_err(|e| Error::wrap("kafka_stream.new", Severity::Fatal, e))?;
        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| Error::wrap("kafka_stream.new", Severity::Fatal, e))?;

        let consumer = Arc::new(consumer);
        let controller = Arc::new(RequestController::new());
        let unacked = Arc::new(Mutex::new(HashMap::new()));

        let poller = spawn_poller(
            Arc::clone(&consumer),
            Arc::clone(&controller),
            Arc::clone(&unacked),
            config.poll_timeout(),
            config.group_id.clone(),
            logger,
        )?;

        Ok(KafkaStreamAdapter {
            controller,
            unacked,
            group_id: config.group_id.clone(),
            disable_commit: config.disable_commit,
            consumer,
            poller: Some(poller),
            closed: false,
        })
    }
}

impl Stream for KafkaStreamAdapter {
    fn next(&mut self, cancel: &CancelToken) -> Result<RawMessage> {
        self.controller.request_job()?;
        self.controller.get_result(cancel)
    }

    fn done(&mut self, cancel: &CancelToken) -> Result<()> {
        let _ = cancel;
        if self.disable_commit {
            return Ok(());
        }

        let snapshot: Vec<((String, i32), i64)> = {
            let mut unacked = self.unacked.lock().expect("unacked offsets mutex poisoned");
            let snapshot = unacked.drain().collect();
            KAFKA_UNACKED_OFFSETS
                .with_label_values(&[&self.group_id])
                .set(0);
            snapshot
        };
        if snapshot.is_empty() {
            return Ok(());
        }

        let mut assignment = TopicPartitionList::new();
        for ((topic, partition), offset) in &snapshot {
            assignment.add_partition_offset(topic, *partition, Offset::Offset(offset + 1));
        }

        if let Err(err) = self.consumer.commit(&assignment, CommitMode::Sync) {
            KAFKA_COMMIT_ERRORS_TOTAL
                .with_label_values(&[&self.group_id])
                .inc();
            warn!(self.consumer_logger(), "kafka offset commit failed"; "error" => %err);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.controller.close();
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
        Ok(())
    }
}

impl KafkaStreamAdapter {
    fn consumer_logger(&self) -> Logger {
        // The adapter doesn't keep its own `Logger` past construction
        // (it's moved into the poller thread); a discard logger here only
        // backs the rare "commit failed" warn which is already counted by
        // `KAFKA_COMMIT_ERRORS_TOTAL`.
        Logger::root(slog::Discard, slog::o!())
    }
}

fn spawn_poller(
    consumer: Arc<StatsConsumer>,
    controller: Arc<RequestController>,
    unacked: Arc<Mutex<HashMap<(String, i32), i64>>>,
    poll_timeout: std::time::Duration,
    group_id: String,
    logger: Logger,
) -> Result<JoinHandle<()>> {
    ThreadBuilder::new("d:kafka:poller")
        .full_name("ductwork:kafka:stream-adapter:poller".to_string())
        .spawn(move |scope| poll_loop(&scope, consumer.as_ref(), &controller, &unacked, poll_timeout, &group_id, &logger))
        .map_err(|e| Error::wrap("kafka_stream.spawn_poller", Severity::Fatal, e))
}

fn poll_loop(
    scope: &humthreads::ThreadScope,
    consumer: &StatsConsumer,
    controller: &RequestController,
    unacked: &Mutex<HashMap<(String, i32), i64>>,
    poll_timeout: std::time::Duration,
    group_id: &str,
    logger: &Logger,
) {
    loop {
        scope.activity("waiting for a job request".to_string());
        if controller.get_next_job().is_err() {
            return;
        }

        loop {
            if controller.is_closed() {
                return;
            }
            scope.activity("polling kafka".to_string());
            match consumer.poll(poll_timeout) {
                None => continue,
                Some(Ok(message)) => {
                    let raw = to_raw_message(&message, unacked);
                    KAFKA_MESSAGES_POLLED_TOTAL.with_label_values(&[group_id]).inc();
                    if controller.submit_result(Ok(raw)).is_err() {
                        return;
                    }
                    break;
                }
                Some(Err(err)) => {
                    warn!(logger, "kafka poll failed, stopping background poller"; "error" => %err);
                    let _ = controller.submit_result(Err(Error::wrap(
                        "kafka_stream.poll_loop",
                        Severity::Fatal,
                        err,
                    )));
                    return;
                }
            }
        }
    }
}

fn to_raw_message(
    message: &rdkafka::message::BorrowedMessage<'_>,
    unacked: &Mutex<HashMap<(String, i32), i64>>,
) -> RawMessage {
    let payload = message.payload().unwrap_or(&[]).to_vec();
    let mut headers = HashMap::new();
    if let Some(key) = message.key() {
        headers.insert(KEY_HEADER.to_string(), key.to_vec());
    }
    if let Some(source_headers) = message.headers() {
        for header in source_headers.iter() {
            if let Some(value) = header.value {
                headers.insert(header.key.to_string(), value.to_vec());
            }
        }
    }

    let topic = message.topic().to_string();
    let partition = message.partition();
    let offset = message.offset();
    {
        let mut unacked = unacked.lock().expect("unacked offsets mutex poisoned");
        let entry = unacked.entry((topic.clone(), partition)).or_insert(offset);
        if offset > *entry {
            *entry = offset;
        }
    }

    let ack_handle = format!("{}:{}:{}", topic, partition, offset);
    RawMessage::with_headers(payload, headers).with_ack_handle(ack_handle)
}
