//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup before
/// any metric is recorded; a second install fails.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// WebSocket connections upgraded on the que path (counter).
pub const QUE_CONNECTIONS_TOTAL: &str = "que_connections_total";
/// Connections currently in the registry's live list (gauge).
pub const QUE_CONNECTIONS_ACTIVE: &str = "que_connections_active";
/// Connections pruned after a failed write or ended liveness (counter).
pub const QUE_PRUNED_TOTAL: &str = "que_pruned_total";
/// Messages fanned out by the registry (counter).
pub const QUE_BROADCASTS_TOTAL: &str = "que_broadcasts_total";
/// WebSocket handlers that returned (counter).
pub const QUE_DISCONNECTIONS_TOTAL: &str = "que_disconnections_total";
