//! Command router: correlates commands submitted by callers with the
//! responses workers send back.
//!
//! A pending record is written before dispatch and removed when the
//! matching response arrives or dispatch fails. Records have no expiry: a
//! worker that never answers leaves its record in place for the life of the
//! process. A caller that reuses a request id while the first is still
//! pending overwrites the earlier record.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use metrics::{counter, gauge};
use nodegate_core::protocol::{self, NodeCommand, NodeResponse, OutboundFrame};
use nodegate_core::{DispatchError, ProtocolError, RelayError, RequestId};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::commander::{NodeCommander, ResponseHandler};
use crate::metrics::{
    ORPHAN_RESPONSES_TOTAL, PENDING_REQUESTS, PROTOCOL_ERRORS_TOTAL, RESPONSES_ROUTED_TOTAL,
};
use crate::registry::{ConnectionRegistry, Identity, Role};
use crate::upstream::UpstreamClient;

/// Who a response must be routed back to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Caller {
    /// The controller slot holder.
    Controller,
    /// A batch caller, by its declared id.
    BatchCaller(String),
    /// The outbound upstream master link.
    Upstream,
}

impl Caller {
    /// Registry role that corresponds to this caller.
    pub fn role(&self) -> Role {
        match self {
            Self::Controller => Role::TestController,
            Self::BatchCaller(_) => Role::BatchCaller,
            Self::Upstream => Role::UpstreamMasterLink,
        }
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatchCaller(id) => write!(f, "batch_caller:{id}"),
            other => f.write_str(other.role().as_str()),
        }
    }
}

/// An in-flight command awaiting its response.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    /// Correlation token.
    pub request_id: String,
    /// Where the response goes.
    pub source: Caller,
    /// Worker the command was sent to.
    pub target_worker_id: String,
    /// When the command was accepted.
    pub created_at: Instant,
    /// Router-unique submission number; tells apart records that reuse an id.
    pub seq: u64,
}

/// Correlates caller submissions with worker responses.
pub struct CommandRouter {
    registry: Arc<ConnectionRegistry>,
    commander: Arc<NodeCommander>,
    pending: DashMap<String, PendingRequest>,
    next_seq: AtomicU64,
    upstream: OnceLock<Arc<UpstreamClient>>,
}

impl CommandRouter {
    /// Create a router over `registry` and `commander`.
    pub fn new(registry: Arc<ConnectionRegistry>, commander: Arc<NodeCommander>) -> Self {
        Self {
            registry,
            commander,
            pending: DashMap::new(),
            next_seq: AtomicU64::new(0),
            upstream: OnceLock::new(),
        }
    }

    /// Attach the upstream link used to answer [`Caller::Upstream`].
    ///
    /// Only the first call takes effect.
    pub fn attach_upstream(&self, upstream: Arc<UpstreamClient>) -> bool {
        self.upstream.set(upstream).is_ok()
    }

    /// Record a pending request and dispatch `command` to `target_worker_id`.
    ///
    /// A missing `request_id` is generated. On dispatch failure this
    /// submission's pending record is removed (a newer record under the same
    /// id is kept) and an error frame carrying the request id is sent
    /// to `source`. Returns the request id used.
    pub fn submit(
        &self,
        target_worker_id: &str,
        command: Value,
        request_id: Option<String>,
        source: Caller,
    ) -> Result<String, DispatchError> {
        let request_id = request_id.unwrap_or_else(|| RequestId::new().into_inner());
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let record = PendingRequest {
            request_id: request_id.clone(),
            source: source.clone(),
            target_worker_id: target_worker_id.to_owned(),
            created_at: Instant::now(),
            seq,
        };
        if let Some(previous) = self.pending.insert(request_id.clone(), record) {
            debug!(
                request_id,
                previous_source = %previous.source,
                "request id reused while pending, overwriting"
            );
        }
        self.update_pending_gauge();

        match self
            .commander
            .dispatch(target_worker_id, command, Some(&request_id))
        {
            Ok(()) => {
                debug!(request_id, node_id = target_worker_id, source = %source, "command submitted");
                Ok(request_id)
            }
            Err(e) => {
                let _ = self.release(&request_id, seq);
                let frame =
                    OutboundFrame::error(Some(&request_id), Some(target_worker_id), e.to_string());
                let _ = self.deliver(&source, &frame);
                Err(e)
            }
        }
    }

    /// Drop the pending record for `request_id` only if it is still the one
    /// written by submission `seq`.
    fn release(&self, request_id: &str, seq: u64) -> bool {
        let removed = self
            .pending
            .remove_if(request_id, |_, record| record.seq == seq)
            .is_some();
        if removed {
            self.update_pending_gauge();
        } else {
            debug!(request_id, "pending record replaced by a newer submission, keeping it");
        }
        removed
    }

    /// Handle one text frame from a caller connection or the upstream link.
    ///
    /// Only `node_command` frames are accepted. Any other frame is answered
    /// with an error frame and no dispatch happens; the caller stays
    /// connected.
    pub fn handle_caller_frame(&self, source: Caller, text: &str) -> Result<String, RelayError> {
        let frame = match protocol::parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject(&source, None, None, &e);
                return Err(e.into());
            }
        };
        let command = match NodeCommand::parse(&frame) {
            Ok(command) => command,
            Err(e) => {
                self.reject(
                    &source,
                    protocol::str_field(&frame, "requestId"),
                    protocol::str_field(&frame, "nodeId"),
                    &e,
                );
                return Err(e.into());
            }
        };
        let NodeCommand {
            node_id,
            request_id,
            command,
        } = command;
        Ok(self.submit(&node_id, command, Some(request_id), source)?)
    }

    fn reject(
        &self,
        source: &Caller,
        request_id: Option<&str>,
        node_id: Option<&str>,
        error: &ProtocolError,
    ) {
        counter!(PROTOCOL_ERRORS_TOTAL, "code" => error.code()).increment(1);
        warn!(source = %source, error = %error, "rejected caller frame");
        let frame = OutboundFrame::error(request_id, node_id, error.to_string());
        let _ = self.deliver(source, &frame);
    }

    /// Send `frame` to `caller` if it is still reachable.
    fn deliver(&self, caller: &Caller, frame: &OutboundFrame) -> bool {
        let delivered = match caller {
            Caller::Controller => self
                .registry
                .controller()
                .filter(|c| c.is_open())
                .is_some_and(|c| c.connection().send_frame(frame)),
            Caller::BatchCaller(id) => self
                .registry
                .lookup_batch_caller(id)
                .filter(|c| c.is_open())
                .is_some_and(|c| c.connection().send_frame(frame)),
            Caller::Upstream => self.upstream.get().is_some_and(|u| u.send(frame)),
        };
        if !delivered {
            info!(
                caller = %caller,
                frame_type = frame.frame_type(),
                "caller no longer connected, dropping frame"
            );
        }
        delivered
    }

    /// Number of in-flight requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `request_id` is awaiting a response.
    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Snapshot of the pending record for `request_id`.
    pub fn pending_request(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.get(request_id).map(|e| e.value().clone())
    }

    #[allow(clippy::cast_precision_loss)]
    fn update_pending_gauge(&self) {
        gauge!(PENDING_REQUESTS).set(self.pending.len() as f64);
    }
}

impl ResponseHandler for CommandRouter {
    fn on_worker_response(&self, worker: &Identity, response: NodeResponse) {
        let NodeResponse {
            request_id,
            response,
        } = response;
        let Some(request_id) = request_id else {
            warn!(node_id = worker.id(), "response without requestId, no caller to notify");
            return;
        };
        let Some((_, pending)) = self.pending.remove(&request_id) else {
            counter!(ORPHAN_RESPONSES_TOTAL).increment(1);
            warn!(node_id = worker.id(), request_id, "no pending request for response, dropping");
            return;
        };
        self.update_pending_gauge();

        debug!(
            request_id,
            node_id = worker.id(),
            source = %pending.source,
            elapsed_ms = u64::try_from(pending.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "routing response"
        );
        let frame = OutboundFrame::NodeResponse {
            request_id,
            node_id: worker.id().to_owned(),
            response,
        };
        if self.deliver(&pending.source, &frame) {
            counter!(RESPONSES_ROUTED_TOTAL).increment(1);
        }
    }
}
