//! # k8mq-server
//!
//! The k8mq broker: accepts WebSocket connections on the que path and fans
//! every inbound message out to all connected clients.
//!
//! - [`QueServer`]: router, listener, shutdown sequence
//! - [`Registry`]: actor owning the live connection list
//! - [`BrokerConfig`] / [`load_config`]: defaults, JSON file, env overrides

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod health;
pub mod loader;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod websocket;

pub use config::BrokerConfig;
pub use error::ConfigError;
pub use loader::load_config;
pub use registry::Registry;
pub use server::{AppState, QueServer, SERVICE_NAME, banner};
