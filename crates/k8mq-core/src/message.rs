//! Wire payloads and outbound envelopes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved payload the broker broadcasts right before it shuts down.
pub const SHUTDOWN_MESSAGE: &str = "k8mq:shutdown";

/// An immutable message payload.
///
/// Cloning is cheap: the bytes are reference counted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Message {
    payload: Bytes,
}

impl Message {
    /// Wrap raw bytes.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Build a correlated JSON payload carrying `correlation_id` and `body`.
    pub fn correlated(
        correlation_id: impl Into<String>,
        body: Value,
    ) -> Result<Self, serde_json::Error> {
        let payload = CorrelatedPayload {
            correlation_id: correlation_id.into(),
            body,
        };
        Ok(Self::new(serde_json::to_vec(&payload)?))
    }

    /// The broker's shutdown sentinel.
    pub fn shutdown() -> Self {
        Self::new(Bytes::from_static(SHUTDOWN_MESSAGE.as_bytes()))
    }

    /// Raw payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Whether this is the broker's shutdown sentinel.
    pub fn is_shutdown(&self) -> bool {
        self.payload.as_ref() == SHUTDOWN_MESSAGE.as_bytes()
    }

    /// Extract the embedded correlation id, if any.
    ///
    /// Anything that is not a JSON object with a non-empty string
    /// `correlationId` field yields `None`; malformed payloads are never an
    /// error.
    pub fn correlation_id(&self) -> Option<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Probe {
            #[serde(default)]
            correlation_id: Option<String>,
        }

        if self.payload.trim_ascii_start().first() != Some(&b'{') {
            return None;
        }
        serde_json::from_slice::<Probe>(&self.payload)
            .ok()
            .and_then(|p| p.correlation_id)
            .filter(|id| !id.is_empty())
    }

    /// Decode the payload as a [`CorrelatedPayload`].
    pub fn to_correlated(&self) -> Option<CorrelatedPayload> {
        serde_json::from_slice(&self.payload).ok()
    }
}

impl From<&'static str> for Message {
    fn from(s: &'static str) -> Self {
        Self::new(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Self::new(v)
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Self::new(b)
    }
}

/// JSON shape of a request/response message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelatedPayload {
    /// Caller-chosen id the reply must echo.
    pub correlation_id: String,
    /// Application body.
    #[serde(default)]
    pub body: Value,
}

/// A message waiting in the client's outbound queue.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// The payload to deliver.
    pub message: Message,
    retries: u32,
}

impl Envelope {
    /// Wrap a freshly enqueued message.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            retries: 0,
        }
    }

    /// How many times this envelope has been requeued.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Bump the retry counter for another pass through the queue.
    #[must_use]
    pub fn requeued(mut self) -> Self {
        self.retries = self.retries.saturating_add(1);
        self
    }
}
