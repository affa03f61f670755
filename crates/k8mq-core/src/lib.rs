//! # k8mq-core
//!
//! Building blocks shared by the k8mq broker and client.
//!
//! - [`Message`] / [`Envelope`]: immutable payloads and their retry bookkeeping
//! - [`CorrelationTable`]: one-shot reply routing keyed by correlation id
//! - [`Transport`] / [`Connector`]: the opaque full-duplex connection capability
//! - [`Backoff`]: exponential retry spacing with cancellable sleeps
//! - [`ShutdownCoordinator`]: `CancellationToken` + deadline-bounded task drain

#![deny(unsafe_code)]

pub mod backoff;
pub mod correlation;
pub mod error;
pub mod logging;
pub mod memory;
pub mod message;
pub mod shutdown;
pub mod transport;

pub use backoff::{Backoff, sleep_or_cancel};
pub use correlation::{CorrelationTable, Registration, Waiter};
pub use error::{QueError, Result};
pub use message::{CorrelatedPayload, Envelope, Message, SHUTDOWN_MESSAGE};
pub use shutdown::ShutdownCoordinator;
pub use transport::{Connector, SharedTransport, Transport, TransportError};

/// Receives every inbound payload that no correlation waiter claimed.
pub type ReadCallback = std::sync::Arc<dyn Fn(Message) + Send + Sync>;

/// Port the broker's WebSocket endpoint listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8088;

/// Path of the WebSocket upgrade endpoint.
pub const DEFAULT_QUE_PATH: &str = "/que";
