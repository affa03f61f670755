//! The full-duplex connection capability the core runs on.
//!
//! Concrete transports live next to the networking layer that produces them
//! (tungstenite on the client, axum on the broker, [`crate::memory`] in tests).

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::Message;

/// Transport-level failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer closed the connection or it was closed locally.
    #[error("connection closed")]
    Closed,
    /// Dialing the remote end failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Any other I/O or protocol failure.
    #[error("transport error: {0}")]
    Io(String),
}

/// A full-duplex frame connection.
///
/// `read` and `write` may be called concurrently from different tasks; an
/// implementation must keep its read and write halves independently locked.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    /// Wait for the next data frame.
    async fn read(&self) -> Result<Message, TransportError>;

    /// Write one frame.
    async fn write(&self, message: &Message) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Shared handle to a live transport.
pub type SharedTransport = Arc<dyn Transport>;

/// Dials new transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Where this connector dials, for logs.
    fn target(&self) -> &str;

    /// Establish a new connection.
    async fn connect(&self) -> Result<SharedTransport, TransportError>;
}
