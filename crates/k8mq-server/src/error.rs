//! Broker configuration errors.

use thiserror::Error;

/// Errors that can occur when loading broker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value was present but unusable.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Result type for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display() {
        let err = ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        ));
        assert_eq!(err.to_string(), "failed to read config file: no such file");
    }

    #[test]
    fn json_error_converts() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: ConfigError = json_err.into();
        assert!(err.to_string().starts_with("failed to parse config JSON"));
    }

    #[test]
    fn invalid_value_display() {
        let err = ConfigError::InvalidValue("port must not be 0".into());
        assert_eq!(err.to_string(), "invalid config value: port must not be 0");
    }
}
