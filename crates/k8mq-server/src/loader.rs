//! Broker config loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with [`BrokerConfig::default()`]
//! 2. If a config path is given (or `CONFIG` names one), deep-merge the file
//!    over the defaults
//! 3. Apply `K8MQ_*` environment overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::error::Result;

/// Env var naming the config file when no path is passed explicitly.
pub const CONFIG_ENV: &str = "CONFIG";

/// Resolve the config path: the explicit one, else `$CONFIG`, else none.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| read_env_string(CONFIG_ENV).map(PathBuf::from))
}

/// Load broker config from `path` (or `$CONFIG`) with env overrides.
///
/// No path at all means defaults. A path that does not exist or holds
/// invalid JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<BrokerConfig> {
    let defaults = serde_json::to_value(BrokerConfig::default())?;

    let merged = match config_path(path) {
        Some(path) => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(&path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        None => {
            debug!("no config file given, using defaults");
            defaults
        }
    };

    let mut config: BrokerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `K8MQ_*` environment overrides.
///
/// Values that fail to parse or fall out of range are logged and ignored.
pub fn apply_env_overrides(config: &mut BrokerConfig) {
    if let Some(v) = read_env_string("K8MQ_HOST") {
        config.host = v;
    }
    if let Some(v) = read_env_u16("K8MQ_PORT", 0, 65535) {
        config.port = v;
    }
    if let Some(v) = read_env_string("K8MQ_QUE_PATH") {
        config.que_path = v;
    }
    if let Some(v) = read_env_u64("K8MQ_SHUTDOWN_TIMEOUT_SECS", 1, 3600) {
        config.shutdown_timeout_secs = v;
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}
