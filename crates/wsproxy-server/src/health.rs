//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process is serving.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Sessions currently tracked by the liveness monitor.
    pub active_sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, active_sessions: usize) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
        active_sessions,
    }
}
