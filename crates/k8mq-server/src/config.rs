//! Broker configuration.

use std::time::Duration;

use k8mq_core::{DEFAULT_PORT, DEFAULT_QUE_PATH};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Paths the router claims for itself.
pub(crate) const RESERVED_PATHS: [&str; 5] =
    ["/", "/status/live", "/status/ready", "/health", "/metrics"];

/// Configuration for the k8mq broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind (default `8088`, `0` for auto-assign).
    pub port: u16,
    /// WebSocket upgrade path.
    pub que_path: String,
    /// Registry mailbox capacity shared by admissions and broadcasts.
    pub mailbox_capacity: usize,
    /// Bound on one broadcast write to one connection, in milliseconds.
    /// A write that exceeds it counts as failed and prunes the connection.
    pub write_timeout_ms: u64,
    /// Pause after broadcasting the shutdown sentinel, in milliseconds.
    pub shutdown_grace_ms: u64,
    /// Deadline for `close`, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            que_path: DEFAULT_QUE_PATH.into(),
            mailbox_capacity: 10,
            write_timeout_ms: 10_000,
            shutdown_grace_ms: 300,
            shutdown_timeout_secs: 20,
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl BrokerConfig {
    /// Reject settings the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue("host must not be empty".into()));
        }
        if !self.que_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "que_path must start with '/': {}",
                self.que_path
            )));
        }
        if RESERVED_PATHS.contains(&self.que_path.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "que_path {} collides with a built-in route",
                self.que_path
            )));
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "mailbox_capacity must be at least 1".into(),
            ));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "write_timeout_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Per-connection broadcast write bound.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Pause after the shutdown sentinel.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Deadline for `close`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
