//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Call once at startup before any metric is recorded; the returned handle
/// renders the `/metrics` endpoint.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Sessions accepted past validation (counter, labels: mode).
pub const SESSIONS_TOTAL: &str = "wsproxy_sessions_total";
/// Sessions currently bridged (gauge).
pub const SESSIONS_ACTIVE: &str = "wsproxy_sessions_active";
/// Upgrade requests rejected before dialing (counter, labels: reason).
pub const SESSIONS_REJECTED_TOTAL: &str = "wsproxy_sessions_rejected_total";
/// Backend connect or TLS handshake failures (counter).
pub const BACKEND_DIAL_FAILURES_TOTAL: &str = "wsproxy_backend_dial_failures_total";
/// Lines relayed (counter, labels: direction = `inbound` | `outbound`).
pub const FRAMES_RELAYED_TOTAL: &str = "wsproxy_frames_relayed_total";
/// Clients terminated for missing a liveness probe (counter).
pub const LIVENESS_EVICTIONS_TOTAL: &str = "wsproxy_liveness_evictions_total";
