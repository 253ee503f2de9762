//! Status bridge: forwards worker lifecycle events from the registry to the
//! upstream master as `node_status` frames.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::registry::NodeEvent;
use crate::upstream::UpstreamClient;

/// Bridges registry events to the upstream link.
pub struct StatusBridge {
    rx: broadcast::Receiver<NodeEvent>,
    upstream: Arc<UpstreamClient>,
}

impl StatusBridge {
    /// Create a new status bridge.
    pub fn new(rx: broadcast::Receiver<NodeEvent>, upstream: Arc<UpstreamClient>) -> Self {
        Self { rx, upstream }
    }

    /// Run the bridge loop until `cancel` fires or the registry goes away.
    ///
    /// Events seen while the link is down are dropped, not replayed.
    #[tracing::instrument(skip_all, name = "status_bridge")]
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = self.rx.recv() => received,
            };
            match received {
                Ok(event) => {
                    if !self.upstream.is_connected() {
                        tracing::debug!(node_id = %event.node_id, status = ?event.status, "upstream down, dropping status");
                        continue;
                    }
                    let _ = self
                        .upstream
                        .report_node_status(&event.node_id, event.status);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "status bridge lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("status bridge: sender closed, exiting");
                    break;
                }
            }
        }
    }
}
