//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection duration seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Commands delivered to workers (counter).
pub const COMMANDS_DISPATCHED_TOTAL: &str = "commands_dispatched_total";
/// Commands that could not be delivered (counter, labels: reason).
pub const DISPATCH_FAILURES_TOTAL: &str = "dispatch_failures_total";
/// Worker responses delivered to their caller (counter).
pub const RESPONSES_ROUTED_TOTAL: &str = "responses_routed_total";
/// Worker responses with no pending request (counter).
pub const ORPHAN_RESPONSES_TOTAL: &str = "orphan_responses_total";
/// In-flight requests awaiting a response (gauge).
pub const PENDING_REQUESTS: &str = "pending_requests";
/// Protocol violations reported to peers (counter, labels: code).
pub const PROTOCOL_ERRORS_TOTAL: &str = "protocol_errors_total";
/// Upstream reconnect attempts scheduled (counter).
pub const UPSTREAM_RECONNECTS_TOTAL: &str = "upstream_reconnects_total";
/// Worker frames relayed to another worker by `targetNodeId` (counter, labels: result).
pub const PEER_FORWARDS_TOTAL: &str = "peer_forwards_total";
/// Connections force-closed by the sweep for exceeding their lifespan (counter).
pub const SWEEP_EXPIRED_TOTAL: &str = "sweep_expired_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_render() {
        // Build a recorder + handle (no global install to avoid test conflicts).
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            COMMANDS_DISPATCHED_TOTAL,
            DISPATCH_FAILURES_TOTAL,
            RESPONSES_ROUTED_TOTAL,
            ORPHAN_RESPONSES_TOTAL,
            PENDING_REQUESTS,
            PROTOCOL_ERRORS_TOTAL,
            UPSTREAM_RECONNECTS_TOTAL,
            SWEEP_EXPIRED_TOTAL,
            PEER_FORWARDS_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
