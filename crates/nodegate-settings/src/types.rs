//! Settings type definitions.
//!
//! All types use camelCase JSON field names and `#[serde(default)]`, so a
//! settings file only needs the keys it overrides.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for the relay.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "auth": { "adminToken": "secret", "nodeSecrets": { "AGENT001": "..." } },
///   "upstream": { "url": "ws://master.internal:9999/ws" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Connection registry timings.
    pub registry: RegistrySettings,
    /// Controller token and per-node credentials.
    pub auth: AuthSettings,
    /// Outbound link to an upstream master.
    pub upstream: UpstreamSettings,
    /// Shutdown behaviour.
    pub shutdown: ShutdownSettings,
}

impl GatewaySettings {
    /// Reject values that would make the relay misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.registry.sweep_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "registry.sweepIntervalMs must be greater than 0".into(),
            ));
        }
        if self.registry.idle_timeout_ms >= self.registry.max_lifespan_ms {
            return Err(SettingsError::InvalidValue(
                "registry.idleTimeoutMs must be shorter than registry.maxLifespanMs".into(),
            ));
        }
        if self.upstream.retry_delay_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "upstream.retryDelayMs must be greater than 0".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` for auto-assign).
    pub port: u16,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before sends fail.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_message_size: 16 * 1024 * 1024,
            send_queue_capacity: 1024,
        }
    }
}

/// Connection registry timings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySettings {
    /// Quiet interval before an `Active` connection becomes `Idle`.
    pub idle_timeout_ms: u64,
    /// Maximum connection lifespan.
    pub max_lifespan_ms: u64,
    /// Sweep period.
    pub sweep_interval_ms: u64,
}

impl RegistrySettings {
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
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
            max_lifespan_ms: 30 * 60 * 1000,
            sweep_interval_ms: 10_000,
        }
    }
}

/// Controller token and per-node credentials.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Shared secret presented as `?adminToken=` by the controller.
    /// When unset the controller path is disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
    /// Per-id secrets; an id listed here must present a matching `token`.
    pub node_secrets: HashMap<String, String>,
    /// Reject ids that have no entry in `node_secrets`.
    pub require_credentials: bool,
}

/// Outbound link to an upstream master.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamSettings {
    /// Upstream master URL; the link is disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Fixed delay between reconnect attempts.
    pub retry_delay_ms: u64,
    /// Bound on waiting for a replaced transport to close.
    pub close_timeout_ms: u64,
    /// Id announced in the registration frame (`middleman-<millis>` if unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: None,
            retry_delay_ms: 5_000,
            close_timeout_ms: 2_000,
            server_id: None,
        }
    }
}

/// Shutdown behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownSettings {
    /// Bounded wait for background tasks before they are aborted.
    pub timeout_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}
