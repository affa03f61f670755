//! Client construction settings.

use std::time::Duration;

use k8mq_core::{Backoff, DEFAULT_PORT, DEFAULT_QUE_PATH, QueError};
use serde::{Deserialize, Serialize};

/// Settings for a [`QueClient`](crate::QueClient).
///
/// Every field has a default; only `server_url` must be supplied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Broker host, e.g. `k8mq.default.svc`. A `ws://` prefix is accepted;
    /// TLS is not, terminate it in front of the broker.
    pub server_url: String,
    /// Broker WebSocket port.
    pub port: u16,
    /// Upgrade path on the broker.
    pub que_path: String,
    /// Outbound queue capacity; enqueue suspends once it is full.
    pub queue_capacity: usize,
    /// Dial attempts per connect cycle.
    pub connect_attempts: u32,
    /// Bound on a single dial, in milliseconds.
    pub dial_timeout_ms: u64,
    /// Write attempts per outbound message.
    pub write_attempts: u32,
    /// Base of the exponential backoff between attempts, in milliseconds.
    pub backoff_base_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            port: DEFAULT_PORT,
            que_path: DEFAULT_QUE_PATH.to_owned(),
            queue_capacity: 100,
            connect_attempts: 5,
            dial_timeout_ms: 5_000,
            write_attempts: 5,
            backoff_base_ms: 1_000,
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at `server_url`.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Override the port. Zero keeps the default.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = if port == 0 { DEFAULT_PORT } else { port };
        self
    }

    /// Override the backoff base.
    #[must_use]
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), QueError> {
        if self.server_url.trim().is_empty() {
            return Err(QueError::InvalidConfig(
                "remote k8mq server url required, eg 'k8mq.default.svc'".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(QueError::InvalidConfig(
                "queue capacity must be at least 1".into(),
            ));
        }
        if self.connect_attempts == 0 {
            return Err(QueError::InvalidConfig(
                "connect attempts must be at least 1".into(),
            ));
        }
        if self.write_attempts == 0 {
            return Err(QueError::InvalidConfig(
                "write attempts must be at least 1".into(),
            ));
        }
        if self.server_url.trim().starts_with("wss://") {
            return Err(QueError::InvalidConfig(format!(
                "wss:// is not supported, dial the broker over plain ws: {}",
                self.server_url
            )));
        }
        if !self.que_path.starts_with('/') {
            return Err(QueError::InvalidConfig(format!(
                "que path must start with '/': {}",
                self.que_path
            )));
        }
        Ok(())
    }

    /// The WebSocket URL to dial: `ws://<host>:<port><que_path>`.
    pub fn dial_url(&self) -> String {
        let host = self.server_url.trim().trim_end_matches('/');
        if host.starts_with("ws://") {
            format!("{host}:{}{}", self.port, self.que_path)
        } else {
            format!("ws://{host}:{}{}", self.port, self.que_path)
        }
    }

    /// Bound on a single dial.
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Backoff between dial attempts.
    pub fn connect_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            self.connect_attempts,
        )
    }

    /// Backoff between write attempts.
    pub fn write_backoff(&self) -> Backoff {
        Backoff::new(Duration::from_millis(self.backoff_base_ms), self.write_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.port, 8088);
        assert_eq!(c.que_path, "/que");
        assert_eq!(c.queue_capacity, 100);
        assert_eq!(c.connect_attempts, 5);
        assert_eq!(c.write_attempts, 5);
        assert_eq!(c.dial_timeout(), Duration::from_secs(5));
        assert_eq!(c.connect_backoff().delay(0), Duration::from_secs(1));
    }

    #[test]
    fn empty_server_url_rejected() {
        assert_matches!(
            ClientConfig::default().validate(),
            Err(QueError::InvalidConfig(msg)) if msg.contains("server url")
        );
        assert!(ClientConfig::new("   ").validate().is_err());
    }

    #[test]
    fn zero_knobs_rejected() {
        let mut c = ClientConfig::new("localhost");
        c.queue_capacity = 0;
        assert!(c.validate().is_err());

        let mut c = ClientConfig::new("localhost");
        c.connect_attempts = 0;
        assert!(c.validate().is_err());

        let mut c = ClientConfig::new("localhost");
        c.write_attempts = 0;
        assert!(c.validate().is_err());

        let mut c = ClientConfig::new("localhost");
        c.que_path = "que".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn dial_url_forms() {
        assert_eq!(
            ClientConfig::new("k8mq.default.svc").dial_url(),
            "ws://k8mq.default.svc:8088/que"
        );
        assert_eq!(
            ClientConfig::new("ws://broker/").with_port(9000).dial_url(),
            "ws://broker:9000/que"
        );
        assert_eq!(ClientConfig::new("h").with_port(0).port, 8088);
    }

    #[test]
    fn tls_scheme_rejected() {
        assert_matches!(
            ClientConfig::new("wss://broker").validate(),
            Err(QueError::InvalidConfig(msg)) if msg.contains("wss://")
        );
    }

    #[test]
    fn deserializes_partial_json() {
        let c: ClientConfig =
            serde_json::from_str(r#"{"serverUrl":"broker","writeAttempts":2}"#).unwrap();
        assert_eq!(c.server_url, "broker");
        assert_eq!(c.write_attempts, 2);
        assert_eq!(c.queue_capacity, 100);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn backoff_base_override() {
        let c = ClientConfig::new("h").with_backoff_base(Duration::from_millis(10));
        assert_eq!(c.write_backoff().delay(2), Duration::from_millis(40));
    }
}
