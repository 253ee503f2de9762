//! Error taxonomy for the relay.
//!
//! - [`ProtocolError`]: malformed or out-of-sequence frames from a peer
//! - [`DispatchError`]: a command could not be delivered to its target worker
//! - [`UpstreamError`]: the outbound link to the upstream master failed
//! - [`RelayError`]: umbrella over the three
//!
//! Every error exposes a stable machine-readable [`code`](RelayError::code)
//! used as a log field and metrics label.

use thiserror::Error;

/// A peer sent a frame the relay cannot accept.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame was not valid JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// The frame was valid JSON but not an object.
    #[error("Frame must be a JSON object")]
    NotAnObject,

    /// A required field was absent or had the wrong type.
    #[error("Missing or invalid field: {0}")]
    MissingField(&'static str),

    /// A required id field was present but blank.
    #[error("Field must not be blank: {0}")]
    BlankId(&'static str),

    /// The frame's `type` is not handled in the current state.
    #[error("Unrecognized message type: {}", .0.as_deref().unwrap_or("<none>"))]
    UnknownMessageType(Option<String>),

    /// Identification was rejected by the credential check.
    #[error("Authentication failed for {0}")]
    AuthenticationFailed(String),
}

impl ProtocolError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) | Self::NotAnObject => "INVALID_JSON",
            Self::MissingField(_) => "MISSING_FIELD",
            Self::BlankId(_) => "BLANK_ID",
            Self::UnknownMessageType(_) => "UNKNOWN_MESSAGE_TYPE",
            Self::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidJson(e.to_string())
    }
}

/// A command could not be handed to its target worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No worker is registered under the id.
    #[error("Node {0} not connected")]
    NodeNotFound(String),

    /// The worker's transport has closed.
    #[error("Node {0} connection is closed")]
    NodeClosed(String),

    /// The worker is registered but `Idle`.
    #[error("Node {0} is idle")]
    NodeIdle(String),

    /// The worker's send queue rejected the frame.
    #[error("Failed to send command to node {0}")]
    SendFailed(String),
}

impl DispatchError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NodeNotFound(_) => "NODE_NOT_FOUND",
            Self::NodeClosed(_) => "NODE_CLOSED",
            Self::NodeIdle(_) => "NODE_IDLE",
            Self::SendFailed(_) => "SEND_FAILED",
        }
    }

    /// Id of the worker the command was addressed to.
    #[must_use]
    pub fn node_id(&self) -> &str {
        match self {
            Self::NodeNotFound(id)
            | Self::NodeClosed(id)
            | Self::NodeIdle(id)
            | Self::SendFailed(id) => id,
        }
    }
}

/// The upstream master link failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// No upstream URL is configured.
    #[error("upstream URL is not set")]
    MissingUrl,

    /// Connection setup failed (bad URL, refused, handshake error).
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Target URL.
        url: String,
        /// Underlying error text.
        message: String,
    },

    /// The established transport reported an error.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// A send was attempted while disconnected.
    #[error("not connected to upstream master")]
    NotConnected,
}

impl UpstreamError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingUrl => "UPSTREAM_MISSING_URL",
            Self::Connect { .. } => "UPSTREAM_CONNECT",
            Self::Transport(_) => "UPSTREAM_TRANSPORT",
            Self::NotConnected => "UPSTREAM_NOT_CONNECTED",
        }
    }
}

/// Top-level relay error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Protocol violation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Routing miss.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Upstream link failure.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl RelayError {
    /// Machine-readable error code of the wrapped error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(e) => e.code(),
            Self::Dispatch(e) => e.code(),
            Self::Upstream(e) => e.code(),
        }
    }
}
