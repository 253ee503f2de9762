//! # nodegate-core
//!
//! Shared vocabulary for the nodegate control-plane relay.
//!
//! - **Protocol**: inbound frame parsing and outbound envelope construction
//!   for workers, batch callers, the controller, and the upstream master
//! - **Errors**: protocol, dispatch, and upstream failures via `thiserror`
//! - **Branded IDs**: `RequestId`, `ConnectionId` as newtypes
//! - **Logging**: `tracing` subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use errors::{DispatchError, ProtocolError, RelayError, UpstreamError};
pub use ids::{ConnectionId, RequestId};
