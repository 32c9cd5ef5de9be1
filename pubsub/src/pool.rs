use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use futures::StreamExt;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::subscriber::ReceivedMessage;
use slog::{debug, warn, Logger};

use ductwork_core::{CancelToken, Error, MessagePool, RawMessage, Result, Severity};

use crate::config::PubSubConfig;
use crate::metrics::{PUBSUB_ACK_ERRORS_TOTAL, PUBSUB_MESSAGES_RECEIVED_TOTAL, PUBSUB_PENDING_MESSAGES};

/// Bridges a Pub/Sub streaming-pull subscription to the [`MessagePool`]
/// contract.
///
/// The SDK drives delivery through a push-style async callback, not a
/// blocking read like Kafka's consumer, so there is no symmetrical
/// `next`/`RequestController` rendezvous to build here. Instead a dedicated
/// background thread owns a small tokio runtime whose only job is running
/// the subscription stream and funnelling each delivered message across an
/// unbounded channel to whichever worker calls `next`. Every delivered
/// message the engine hasn't yet acked or nacked is kept in `pending`,
/// keyed by an opaque ack handle carried on the `RawMessage` itself, so
/// `done`/`failed` can find it again and drive the SDK's ack/nack calls on
/// the same runtime.
pub struct PubSubPoolAdapter {
    subscription: String,
    next_rx: Receiver<RawMessage>,
    pending: Arc<Mutex<HashMap<String, ReceivedMessage>>>,
    runtime_handle: tokio::runtime::Handle,
    closed: CancelToken,
    worker: Option<thread::JoinHandle<()>>,
}

impl PubSubPoolAdapter {
    pub fn new(config: &PubSubConfig, logger: Logger) -> Result<PubSubPoolAdapter> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .thread_name("ductwork-pubsub-rt")
            .build()
            .map_err(|e| Error::wrap("pubsub_pool.new", Severity::Fatal, e))?;
        let runtime_handle = runtime.handle().clone();

        let (next_tx, next_rx) = unbounded();
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancelToken::new();

        let project_id = config.project_id.clone();
        let subscription_name = config.subscription.clone();
        let bg_pending = Arc::clone(&pending);
        let bg_closed = closed.clone();
        let bg_logger = logger.clone();

        let worker = thread::Builder::new()
            .name("d:pubsub:receiver".into())
            .spawn(move || {
                runtime.block_on(receive_loop(
                    project_id,
                    subscription_name,
                    next_tx,
                    bg_pending,
                    bg_closed,
                    bg_logger,
                ));
            })
            .map_err(|e| Error::wrap("pubsub_pool.new", Severity::Fatal, e))?;

        Ok(PubSubPoolAdapter {
            subscription: config.subscription.clone(),
            next_rx,
            pending,
            runtime_handle,
            closed,
            worker: Some(worker),
        })
    }

    fn take_pending(&self, msg: &RawMessage) -> Result<ReceivedMessage> {
        let handle = msg
            .ack_handle()
            .ok_or_else(|| Error::msg("pubsub_pool.ack", Severity::Fatal, "message carries no ack handle"))?;
        let mut pending = self.pending.lock().expect("pubsub pending map poisoned");
        let received = pending
            .remove(handle)
            .ok_or_else(|| Error::msg("pubsub_pool.ack", Severity::Runtime, "message already acked or nacked"))?;
        PUBSUB_PENDING_MESSAGES
            .with_label_values(&[&self.subscription])
            .set(pending.len() as i64);
        Ok(received)
    }
}

impl MessagePool for PubSubPoolAdapter {
    fn next(&self, cancel: &CancelToken) -> Result<RawMessage> {
        select! {
            recv(self.next_rx) -> msg => match msg {
                Ok(msg) => Ok(msg),
                Err(_) => Err(Error::eof("pubsub_pool.next")),
            },
            recv(self.closed.cancel_receiver()) -> _ => Err(Error::eof("pubsub_pool.next")),
            recv(cancel.cancel_receiver()) -> _ => Err(Error::cancelled("pubsub_pool.next")),
        }
    }

    fn done(&self, _cancel: &CancelToken, msg: &RawMessage) -> Result<()> {
        let received = self.take_pending(msg)?;
        let outcome = self.runtime_handle.block_on(received.ack());
        if let Err(err) = outcome {
            PUBSUB_ACK_ERRORS_TOTAL.with_label_values(&[&self.subscription]).inc();
            return Err(Error::wrap("pubsub_pool.done", Severity::Runtime, err));
        }
        Ok(())
    }

    fn failed(&self, _cancel: &CancelToken, msg: &RawMessage) -> Result<()> {
        let received = self.take_pending(msg)?;
        self.runtime_handle.block_on(received.nack());
        Ok(())
    }
}

impl Drop for PubSubPoolAdapter {
    fn drop(&mut self) {
        self.closed.cancel();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

async fn receive_loop(
    project_id: String,
    subscription_name: String,
    next_tx: Sender<RawMessage>,
    pending: Arc<Mutex<HashMap<String, ReceivedMessage>>>,
    closed: CancelToken,
    logger: Logger,
) {
    let config = match ClientConfig::default().with_auth().await {
        Ok(config) => config,
        Err(err) => {
            warn!(logger, "failed to build pubsub client config"; "error" => %err);
            closed.cancel();
            return;
        }
    };
    let client = match Client::new(config).await {
        Ok(client) => client,
        Err(err) => {
            warn!(logger, "failed to build pubsub client"; "error" => %err);
            closed.cancel();
            return;
        }
    };
    let full_name = format!("projects/{}/subscriptions/{}", project_id, subscription_name);
    let subscription = client.subscription(&full_name);
    let mut stream = match subscription.subscribe(None).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(logger, "failed to open pubsub subscription"; "error" => %err);
            closed.cancel();
            return;
        }
    };

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let bridge_closed = closed.clone();
    tokio::task::spawn_blocking(move || {
        let _ = bridge_closed.cancel_receiver().recv();
        let _ = stop_tx.send(());
    });
    tokio::pin!(stop_rx);

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            item = stream.next() => {
                match item {
                    None => break,
                    Some(message) => {
                        let ack_id = message.ack_id().to_string();
                        let raw = RawMessage::new(message.message.data.clone()).with_ack_handle(ack_id.clone());
                        {
                            let mut pending = pending.lock().expect("pubsub pending map poisoned");
                            pending.insert(ack_id, message);
                            PUBSUB_PENDING_MESSAGES
                                .with_label_values(&[&subscription_name])
                                .set(pending.len() as i64);
                        }
                        PUBSUB_MESSAGES_RECEIVED_TOTAL.with_label_values(&[&subscription_name]).inc();
                        if next_tx.send(raw).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!(logger, "pubsub receive loop exiting");
    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ductwork_core::mock::MockPool;

    // The adapter's own integration behaviour (connecting to a real
    // subscription, driving the background tokio runtime) can't be
    // exercised without live credentials; the MessagePool contract itself
    // is already covered end to end by engine::JobPoolEngine's tests
    // against MockPool.
    #[test]
    fn mock_pool_still_satisfies_the_same_contract() {
        let pool = MockPool::new(vec![RawMessage::new(b"1".to_vec())]);
        let cancel = CancelToken::new();
        let msg = pool.next(&cancel).unwrap();
        pool.done(&cancel, &msg).unwrap();
    }
}
