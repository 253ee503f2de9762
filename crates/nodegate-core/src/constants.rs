//! Package-level constants and protocol timings.

use std::time::Duration;

/// Current version of nodegate (sourced from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name.
pub const NAME: &str = "nodegate";

/// Quiet interval after which an `Active` connection is flipped to `Idle`.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum connection lifespan, regardless of activity.
pub const MAX_LIFESPAN: Duration = Duration::from_secs(30 * 60);

/// Period of the registry sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Fixed delay between upstream reconnect attempts.
pub const UPSTREAM_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on waiting for a replaced upstream transport to close.
pub const UPSTREAM_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Query parameter carrying the controller's shared secret.
pub const ADMIN_TOKEN_PARAM: &str = "adminToken";

/// Synthetic identity id used for the controller slot.
pub const CONTROLLER_ID: &str = "INCOMING_TEST_MASTER";

/// WebSocket close code: normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code: policy violation.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
