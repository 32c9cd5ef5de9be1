use std::collections::HashMap;

/// A single unit of work as it enters the pipeline from a `Stream` or
/// `MessagePool`.
///
/// `RawMessage` is deliberately opaque about payload structure: this crate's
/// job is moving bytes through a pipeline with the right ordering and
/// delivery guarantees, not decoding them. Handlers are responsible for
/// interpreting `payload`.
#[derive(Clone, Debug)]
pub struct RawMessage {
    payload: Vec<u8>,
    headers: HashMap<String, Vec<u8>>,
    /// Opaque handle a source attaches to a message so it can later find it
    /// again on `done`/`failed` (e.g. a Kafka offset or a Pub/Sub ack ID).
    /// Handlers never inspect this; only the source that produced the
    /// message does.
    ack_handle: Option<String>,
}

impl RawMessage {
    pub fn new(payload: Vec<u8>) -> RawMessage {
        RawMessage {
            payload,
            headers: HashMap::new(),
            ack_handle: None,
        }
    }

    pub fn with_headers(payload: Vec<u8>, headers: HashMap<String, Vec<u8>>) -> RawMessage {
        RawMessage {
            payload,
            headers,
            ack_handle: None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Adapter-inserted headers (e.g. the original broker key) plus every
    /// user header present on the source record, keyed by name with raw
    /// byte values: headers are not guaranteed to be valid UTF-8.
    pub fn headers(&self) -> &HashMap<String, Vec<u8>> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&[u8]> {
        self.headers.get(key).map(Vec::as_slice)
    }

    pub fn ack_handle(&self) -> Option<&str> {
        self.ack_handle.as_deref()
    }

    /// Attaches the source-specific handle used to acknowledge this message
    /// later. Called by adapters (`KafkaStreamAdapter`, the Pub/Sub pool)
    /// when they build a `RawMessage`, never by handler code.
    pub fn with_ack_handle<S: Into<String>>(mut self, handle: S) -> RawMessage {
        self.ack_handle = Some(handle.into());
        self
    }
}
