//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered identities of every role.
    pub connections: usize,
    /// Registered workers.
    pub workers: usize,
    /// Requests awaiting a worker response.
    pub pending_requests: usize,
    /// Upstream link state; `None` when no upstream is configured.
    pub upstream_connected: Option<bool>,
}

/// Live counters sampled for one health response.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthCounters {
    /// Registered identities.
    pub connections: usize,
    /// Registered workers.
    pub workers: usize,
    /// Pending requests.
    pub pending_requests: usize,
    /// Upstream link state, if configured.
    pub upstream_connected: Option<bool>,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, counters: HealthCounters) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: counters.connections,
        workers: counters.workers,
        pending_requests: counters.pending_requests,
        upstream_connected: counters.upstream_connected,
    }
}
