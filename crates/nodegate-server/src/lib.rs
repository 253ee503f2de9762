//! # nodegate-server
//!
//! Control-plane relay between command callers and a fleet of worker nodes.
//!
//! - [`registry`]: live connection identities, roles, idle/expiry sweep
//! - [`commander`]: command delivery to a single active worker
//! - [`router`]: request-id correlation between callers and workers
//! - [`websocket`]: per-connection session state machine over axum WebSockets
//! - [`upstream`]: outbound link to an upstream master with fixed-delay retry
//! - HTTP endpoints: `/health`, `/metrics`, `/ws`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod commander;
pub mod config;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod status_bridge;
pub mod upstream;
pub mod websocket;

pub use server::GatewayServer;
