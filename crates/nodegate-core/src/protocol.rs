//! Wire protocol: JSON text frames exchanged with workers, batch callers,
//! the controller, and the upstream master.
//!
//! Inbound frames are parsed field-by-field from a `serde_json::Value` so
//! that errors can name the exact missing field. Outbound frames are a
//! single internally tagged [`OutboundFrame`] enum.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;

/// Inbound `type` values.
pub mod types {
    /// Worker identification.
    pub const IDENTIFY_WORKER: &str = "identify_rpa_node";
    /// Batch caller identification.
    pub const IDENTIFY_BATCH_CLIENT: &str = "identify_batch_client";
    /// Liveness check.
    pub const PING: &str = "ping";
    /// Command submission from a caller.
    pub const NODE_COMMAND: &str = "node_command";
    /// Worker response to a command.
    pub const NODE_RESPONSE: &str = "node_response";
    /// Legacy worker response type emitted by older agents.
    pub const COMMAND_RESPONSE: &str = "commandResponse";
}

/// Field names shared by several inbound frame types.
pub mod fields {
    /// Worker-to-worker relay target.
    pub const TARGET_NODE_ID: &str = "targetNodeId";
}

/// Parse a text frame into a JSON object.
pub fn parse_frame(text: &str) -> Result<Value, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(ProtocolError::NotAnObject)
    }
}

/// The frame's `type` field, if it is a string.
pub fn frame_type(frame: &Value) -> Option<&str> {
    frame.get("type").and_then(Value::as_str)
}

/// A string field of the frame, if present.
pub fn str_field<'a>(frame: &'a Value, key: &str) -> Option<&'a str> {
    frame.get(key).and_then(Value::as_str)
}

fn required_id(frame: &Value, key: &'static str) -> Result<String, ProtocolError> {
    let value = str_field(frame, key).ok_or(ProtocolError::MissingField(key))?;
    if value.trim().is_empty() {
        return Err(ProtocolError::BlankId(key));
    }
    Ok(value.to_owned())
}

/// Whether `ty` is a worker response frame type.
pub fn is_response_type(ty: &str) -> bool {
    ty == types::NODE_RESPONSE || ty == types::COMMAND_RESPONSE
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// First frame on an unidentified connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identify {
    /// `{"type":"identify_rpa_node","nodeId":..}`
    Worker {
        /// Worker id chosen by the peer.
        node_id: String,
        /// Optional credential.
        token: Option<String>,
    },
    /// `{"type":"identify_batch_client","clientId":..}`
    BatchCaller {
        /// Caller id chosen by the peer.
        client_id: String,
        /// Optional credential.
        token: Option<String>,
    },
}

impl Identify {
    /// Parse an identification frame.
    pub fn parse(frame: &Value) -> Result<Self, ProtocolError> {
        let token = str_field(frame, "token").map(str::to_owned);
        match frame_type(frame) {
            Some(types::IDENTIFY_WORKER) => Ok(Self::Worker {
                node_id: required_id(frame, "nodeId")?,
                token,
            }),
            Some(types::IDENTIFY_BATCH_CLIENT) => Ok(Self::BatchCaller {
                client_id: required_id(frame, "clientId")?,
                token,
            }),
            other => Err(ProtocolError::UnknownMessageType(other.map(str::to_owned))),
        }
    }

    /// The declared id.
    pub fn id(&self) -> &str {
        match self {
            Self::Worker { node_id, .. } => node_id,
            Self::BatchCaller { client_id, .. } => client_id,
        }
    }

    /// The presented credential, if any.
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Worker { token, .. } | Self::BatchCaller { token, .. } => token.as_deref(),
        }
    }
}

/// `{"type":"node_command","nodeId","requestId","command"}` from a caller.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeCommand {
    /// Target worker id.
    pub node_id: String,
    /// Caller-supplied correlation token.
    pub request_id: String,
    /// Opaque command payload.
    pub command: Value,
}

impl NodeCommand {
    /// Parse a command submission frame.
    pub fn parse(frame: &Value) -> Result<Self, ProtocolError> {
        match frame_type(frame) {
            Some(types::NODE_COMMAND) => {}
            other => return Err(ProtocolError::UnknownMessageType(other.map(str::to_owned))),
        }
        let node_id = required_id(frame, "nodeId")?;
        let request_id = required_id(frame, "requestId")?;
        let command = match frame.get("command") {
            Some(v) if !v.is_null() => v.clone(),
            _ => return Err(ProtocolError::MissingField("command")),
        };
        Ok(Self {
            node_id,
            request_id,
            command,
        })
    }
}

/// A worker's response to a dispatched command.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeResponse {
    /// Correlation token, if the worker echoed one.
    pub request_id: Option<String>,
    /// Raw response payload (`{}` when absent).
    pub response: Value,
}

impl NodeResponse {
    /// Extract the correlation token and payload from a response frame.
    pub fn from_frame(frame: &Value) -> Self {
        Self {
            request_id: str_field(frame, "requestId").map(str::to_owned),
            response: frame
                .get("response")
                .cloned()
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Worker status reported to the upstream master.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatusReport {
    /// Worker identified.
    Connected,
    /// Worker record removed.
    Disconnected,
    /// Worker went quiet past the idle threshold.
    Idle,
}

/// Every frame the gateway sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Wrapped command, gateway → worker.
    #[serde(rename_all = "camelCase")]
    Command {
        /// Correlation token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Opaque command payload.
        command: Value,
    },
    /// Worker response wrapped for the originating caller.
    #[serde(rename_all = "camelCase")]
    NodeResponse {
        /// Correlation token.
        request_id: String,
        /// Responding worker.
        node_id: String,
        /// Raw worker payload.
        response: Value,
    },
    /// Error report to a caller or an unidentified peer.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Correlation token of the failed submission.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Target worker of the failed submission.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        /// Human-readable reason.
        message: String,
    },
    /// Successful identification.
    Acknowledgement {
        /// Human-readable confirmation.
        message: String,
    },
    /// Reply to `ping`.
    Pong,
    /// Worker lifecycle report, gateway → upstream master.
    #[serde(rename_all = "camelCase")]
    NodeStatus {
        /// Worker id.
        node_id: String,
        /// New status.
        status: NodeStatusReport,
    },
    /// One-shot registration, gateway → upstream master.
    #[serde(rename_all = "camelCase")]
    MiddlemanRegister {
        /// This gateway instance.
        server_id: String,
    },
}

impl OutboundFrame {
    /// Build an error frame.
    pub fn error(
        request_id: Option<&str>,
        node_id: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self::Error {
            request_id: request_id.map(str::to_owned),
            node_id: node_id.map(str::to_owned),
            message: message.into(),
        }
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The wire `type` of this frame.
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::NodeResponse { .. } => "node_response",
            Self::Error { .. } => "error",
            Self::Acknowledgement { .. } => "acknowledgement",
            Self::Pong => "pong",
            Self::NodeStatus { .. } => "node_status",
            Self::MiddlemanRegister { .. } => "middleman_register",
        }
    }
}
