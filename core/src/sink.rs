use crate::cancel::CancelToken;
use crate::error::Result;

/// A message on its way out of the pipeline, destined for an external
/// store (Elasticsearch, BigQuery, GCS, ...). Distinct from
/// [`crate::message::RawMessage`], which represents a message coming in:
/// by the time a `SinkMessage` exists, a handler has already transformed
/// the input into whatever shape the destination expects.
#[derive(Clone, Debug)]
pub struct SinkMessage {
    key: Option<String>,
    payload: Vec<u8>,
}

impl SinkMessage {
    pub fn new(payload: Vec<u8>) -> SinkMessage {
        SinkMessage {
            key: None,
            payload,
        }
    }

    pub fn with_key<S: Into<String>>(payload: Vec<u8>, key: S) -> SinkMessage {
        SinkMessage {
            key: Some(key.into()),
            payload,
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Externalizes a batch of [`SinkMessage`]s to wherever this pipeline's
/// output lives.
///
/// Implementations must be safe to call repeatedly with the same slice:
/// the sink retrier (see `ductwork_middleware::sink_retry`) retries
/// `store` calls that fail with a `Runtime`-severity error, so a sink that
/// is not idempotent under retry must dedupe on its own (e.g. using each
/// message's key).
pub trait Sink: Send + Sync {
    fn store(&self, cancel: &CancelToken, msgs: &[SinkMessage]) -> Result<()>;
}
