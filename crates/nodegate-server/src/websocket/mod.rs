//! WebSocket connection handles, the per-connection session state machine,
//! and the axum session loop.

pub mod connection;
pub mod handler;
pub mod session;
