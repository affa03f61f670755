//! # k8mq-client
//!
//! Connects to a k8mq broker, keeps the connection alive across failures,
//! and moves messages both ways.
//!
//! - [`QueClient`]: send loop, receive loop, correlation waiters, graceful close
//! - [`ClientConfig`]: dial target and retry tuning
//! - [`WsConnector`]: the `tokio-tungstenite` dialer used by [`QueClient::start`]

#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod transport;

pub use config::ClientConfig;
pub use engine::{ClientState, QueClient};
pub use transport::{WsConnector, WsTransport};
