//! Error types shared by the broker and client.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced to callers of the k8mq core.
///
/// Transient connect and write failures never show up here; the loops that
/// own them log and retry instead.
#[derive(Debug, Error)]
pub enum QueError {
    /// A component was constructed with unusable settings.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The queue or mailbox no longer accepts work because shutdown started.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// A bounded wait elapsed before the work finished.
    #[error("{component} timed out after {timeout_ms}ms")]
    Timeout {
        /// What was being waited on.
        component: &'static str,
        /// How long we waited.
        timeout_ms: u64,
    },

    /// The waiter for a correlation id went away before a reply arrived,
    /// usually because a newer registration replaced it.
    #[error("waiter for correlation id '{correlation_id}' was dropped")]
    WaiterDropped {
        /// The correlation id that lost its waiter.
        correlation_id: String,
    },

    /// Failed to build a payload.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// Transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl QueError {
    /// Build a timeout error from a [`std::time::Duration`].
    pub fn timeout(component: &'static str, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            component,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Result type for k8mq operations.
pub type Result<T> = std::result::Result<T, QueError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn invalid_config_display() {
        let err = QueError::InvalidConfig("server url required".into());
        assert_eq!(
            err.to_string(),
            "invalid configuration: server url required"
        );
    }

    #[test]
    fn closed_display() {
        let err = QueError::Closed("outbound queue");
        assert_eq!(err.to_string(), "outbound queue is closed");
    }

    #[test]
    fn timeout_from_duration() {
        let err = QueError::timeout("client", Duration::from_millis(1500));
        assert!(matches!(
            err,
            QueError::Timeout {
                component: "client",
                timeout_ms: 1500
            }
        ));
        assert_eq!(err.to_string(), "client timed out after 1500ms");
    }

    #[test]
    fn waiter_dropped_display() {
        let err = QueError::WaiterDropped {
            correlation_id: "abc".into(),
        };
        assert!(err.to_string().contains("'abc'"));
    }

    #[test]
    fn transport_error_converts() {
        let err: QueError = TransportError::Closed.into();
        assert!(matches!(err, QueError::Transport(TransportError::Closed)));
        assert_eq!(err.to_string(), "connection closed");
    }

    #[test]
    fn encode_error_converts() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: QueError = json_err.into();
        assert!(err.to_string().starts_with("failed to encode payload"));
    }
}
