//! `/health` and the Kubernetes status probes.

use serde::Serialize;
use std::time::Instant;

/// Probe body while the broker is accepting traffic.
pub const RUNNING_BODY: &str = "Things look good";
/// Probe body once shutdown started.
pub const NOT_RUNNING_BODY: &str = "Not Running";

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while running, `"shutting_down"` after.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Connections in the registry's live list.
    pub connections: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, running: bool) -> HealthResponse {
    HealthResponse {
        status: if running { "ok" } else { "shutting_down" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
    }
}
