//! Server configuration.

use std::collections::HashMap;
use std::time::Duration;

use nodegate_settings::GatewaySettings;
use serde::{Deserialize, Serialize};

/// Configuration for the relay server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Quiet interval before an active connection is marked idle.
    pub idle_timeout_ms: u64,
    /// Maximum connection lifespan.
    pub max_lifespan_ms: u64,
    /// Registry sweep period.
    pub sweep_interval_ms: u64,
    /// Shared secret for the controller path; `None` disables it.
    pub admin_token: Option<String>,
    /// Per-id credentials checked at identification.
    pub node_secrets: HashMap<String, String>,
    /// Reject ids with no configured credential.
    pub require_credentials: bool,
    /// Outbound upstream link; `None` disables it.
    pub upstream: Option<UpstreamConfig>,
    /// Bounded wait for background tasks during shutdown.
    pub shutdown_timeout_ms: u64,
}

/// Upstream master link configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// `ws://` or `wss://` URL of the upstream master.
    pub url: String,
    /// Fixed delay between reconnect attempts.
    pub retry_delay_ms: u64,
    /// Bound on waiting for a replaced transport to close.
    pub close_timeout_ms: u64,
    /// Id sent in the registration frame; generated when `None`.
    pub server_id: Option<String>,
}

impl UpstreamConfig {
    /// Link config for `url` with default timings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            retry_delay_ms: 5_000,
            close_timeout_ms: 2_000,
            server_id: None,
        }
    }

    /// Retry delay as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Close bound as a `Duration`.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl ServerConfig {
    /// Build a server config from loaded settings.
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_message_size: settings.server.max_message_size,
            send_queue_capacity: settings.server.send_queue_capacity,
            idle_timeout_ms: settings.registry.idle_timeout_ms,
            max_lifespan_ms: settings.registry.max_lifespan_ms,
            sweep_interval_ms: settings.registry.sweep_interval_ms,
            admin_token: settings.auth.admin_token.clone(),
            node_secrets: settings.auth.node_secrets.clone(),
            require_credentials: settings.auth.require_credentials,
            upstream: settings.upstream.url.as_ref().map(|url| UpstreamConfig {
                url: url.clone(),
                retry_delay_ms: settings.upstream.retry_delay_ms,
                close_timeout_ms: settings.upstream.close_timeout_ms,
                server_id: settings.upstream.server_id.clone(),
            }),
            shutdown_timeout_ms: settings.shutdown.timeout_ms,
        }
    }

    /// Idle threshold as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Lifespan as a `Duration`.
    pub fn max_lifespan(&self) -> Duration {
        Duration::from_millis(self.max_lifespan_ms)
    }

    /// Sweep period as a `Duration`.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Shutdown bound as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            send_queue_capacity: 1024,
            idle_timeout_ms: 30_000,
            max_lifespan_ms: 30 * 60 * 1000,
            sweep_interval_ms: 10_000,
            admin_token: None,
            node_secrets: HashMap::new(),
            require_credentials: false,
            upstream: None,
            shutdown_timeout_ms: 5_000,
        }
    }
}
