//! Outbound command delivery to a single worker.

use std::sync::Arc;

use metrics::counter;
use nodegate_core::DispatchError;
use nodegate_core::protocol::{self, NodeResponse, OutboundFrame};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::metrics::{
    COMMANDS_DISPATCHED_TOTAL, DISPATCH_FAILURES_TOTAL, PEER_FORWARDS_TOTAL,
};
use crate::registry::{ConnectionRegistry, Identity, NodeStatus};

/// Receives response frames a worker sends back.
pub trait ResponseHandler: Send + Sync {
    /// Handle one response frame from `worker`.
    fn on_worker_response(&self, worker: &Identity, response: NodeResponse);
}

/// What happened to an inbound worker frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerFrameOutcome {
    /// Passed to the response handler.
    Response,
    /// Relayed unchanged to the worker named by `targetNodeId`.
    Forwarded(String),
    /// Carried a `targetNodeId` that is not registered or not open.
    TargetUnavailable(String),
    /// Valid JSON with a type the relay does not act on.
    Ignored(Option<String>),
    /// Not a JSON object.
    Malformed,
}

/// Formats commands into envelopes and sends them to active workers.
pub struct NodeCommander {
    registry: Arc<ConnectionRegistry>,
}

impl NodeCommander {
    /// Create a commander over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `command` to `worker_id`.
    ///
    /// The worker must be registered, open, and `Active`; an idle worker is
    /// not eligible for new commands. Nothing is sent on failure.
    pub fn dispatch(
        &self,
        worker_id: &str,
        command: Value,
        request_id: Option<&str>,
    ) -> Result<(), DispatchError> {
        let result = self.try_dispatch(worker_id, command, request_id);
        match &result {
            Ok(()) => {
                counter!(COMMANDS_DISPATCHED_TOTAL).increment(1);
                debug!(node_id = worker_id, request_id, "command dispatched");
            }
            Err(e) => {
                counter!(DISPATCH_FAILURES_TOTAL, "reason" => e.code()).increment(1);
                warn!(node_id = worker_id, request_id, error = %e, "command not dispatched");
            }
        }
        result
    }

    fn try_dispatch(
        &self,
        worker_id: &str,
        command: Value,
        request_id: Option<&str>,
    ) -> Result<(), DispatchError> {
        let worker = self
            .registry
            .lookup_by_id(worker_id)
            .ok_or_else(|| DispatchError::NodeNotFound(worker_id.to_owned()))?;
        if !worker.is_open() {
            return Err(DispatchError::NodeClosed(worker_id.to_owned()));
        }
        if worker.status() != NodeStatus::Active {
            return Err(DispatchError::NodeIdle(worker_id.to_owned()));
        }
        let frame = OutboundFrame::Command {
            request_id: request_id.map(str::to_owned),
            command,
        };
        if worker.connection().send_frame(&frame) {
            Ok(())
        } else {
            Err(DispatchError::SendFailed(worker_id.to_owned()))
        }
    }

    /// Interpret one text frame from an authenticated worker.
    ///
    /// A non-ping frame carrying `targetNodeId` is relayed as-is to that
    /// worker and never reaches `handler`. Response frames go to `handler`;
    /// anything else, including malformed JSON, is logged and ignored. The
    /// connection stays open either way.
    pub fn handle_inbound_worker_frame(
        &self,
        worker: &Identity,
        text: &str,
        handler: &dyn ResponseHandler,
    ) -> WorkerFrameOutcome {
        let frame = match protocol::parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node_id = worker.id(), error = %e, "malformed frame from worker");
                return WorkerFrameOutcome::Malformed;
            }
        };
        let ty = protocol::frame_type(&frame);
        let target = protocol::str_field(&frame, protocol::fields::TARGET_NODE_ID)
            .filter(|_| ty != Some(protocol::types::PING));
        if let Some(target) = target {
            return self.forward_to_peer(worker, target, text);
        }
        match ty {
            Some(ty) if protocol::is_response_type(ty) => {
                handler.on_worker_response(worker, NodeResponse::from_frame(&frame));
                WorkerFrameOutcome::Response
            }
            other => {
                debug!(node_id = worker.id(), frame_type = ?other, "ignoring worker frame");
                WorkerFrameOutcome::Ignored(other.map(str::to_owned))
            }
        }
    }

    /// Relay `text` unchanged from `sender` to the worker `target_id`.
    ///
    /// Idle targets still receive peer frames; only an open transport is
    /// required.
    fn forward_to_peer(&self, sender: &Identity, target_id: &str, text: &str) -> WorkerFrameOutcome {
        let delivered = self
            .registry
            .lookup_by_id(target_id)
            .filter(|target| target.is_open())
            .is_some_and(|target| target.connection().send(Arc::new(text.to_owned())));
        if delivered {
            counter!(PEER_FORWARDS_TOTAL, "result" => "delivered").increment(1);
            info!(from = sender.id(), to = target_id, "forwarded worker frame");
            WorkerFrameOutcome::Forwarded(target_id.to_owned())
        } else {
            counter!(PEER_FORWARDS_TOTAL, "result" => "unavailable").increment(1);
            warn!(from = sender.id(), to = target_id, "forward target not found or not available");
            WorkerFrameOutcome::TargetUnavailable(target_id.to_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ClientConnection;
    use assert_matches::assert_matches;
    use nodegate_core::ConnectionId;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, NodeResponse)>>,
    }

    impl ResponseHandler for Recorder {
        fn on_worker_response(&self, worker: &Identity, response: NodeResponse) {
            self.seen.lock().push((worker.id().to_owned(), response));
        }
    }

    fn setup() -> (Arc<ConnectionRegistry>, NodeCommander) {
        let registry = Arc::new(ConnectionRegistry::new(
            Duration::from_secs(30),
            Duration::from_secs(1800),
        ));
        let commander = NodeCommander::new(registry.clone());
        (registry, commander)
    }

    fn worker(
        registry: &ConnectionRegistry,
        id: &str,
    ) -> (Arc<Identity>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
        (registry.register_worker(id, conn), rx)
    }

    #[test]
    fn dispatch_sends_exactly_one_command_frame() {
        let (registry, commander) = setup();
        let (_w, mut rx) = worker(&registry, "w1");

        commander
            .dispatch("w1", serde_json::json!({"action": "run"}), Some("r1"))
            .unwrap();

        let sent: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(
            sent,
            serde_json::json!({"type": "command", "requestId": "r1", "command": {"action": "run"}})
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_without_request_id_omits_field() {
        let (registry, commander) = setup();
        let (_w, mut rx) = worker(&registry, "w1");
        commander.dispatch("w1", serde_json::json!(1), None).unwrap();
        let sent: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert!(sent.get("requestId").is_none());
    }

    #[test]
    fn dispatch_to_unknown_worker_fails() {
        let (_registry, commander) = setup();
        assert_matches!(
            commander.dispatch("ghost", Value::Null, Some("r1")),
            Err(DispatchError::NodeNotFound(id)) if id == "ghost"
        );
    }

    #[test]
    fn dispatch_to_closed_worker_fails() {
        let (registry, commander) = setup();
        let (w, _rx) = worker(&registry, "w1");
        w.connection().mark_closed();
        assert_matches!(
            commander.dispatch("w1", Value::Null, None),
            Err(DispatchError::NodeClosed(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_to_idle_worker_fails_without_sending() {
        let (registry, commander) = setup();
        let (w, mut rx) = worker(&registry, "w1");
        tokio::time::advance(Duration::from_secs(31)).await;
        let _ = registry.sweep();
        assert!(w.is_open());

        assert_matches!(
            commander.dispatch("w1", Value::Null, Some("r1")),
            Err(DispatchError::NodeIdle(_))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_to_full_queue_fails() {
        let (registry, commander) = setup();
        let (tx, _rx) = mpsc::channel(1);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
        let _ = registry.register_worker("w1", conn);
        commander.dispatch("w1", Value::Null, None).unwrap();
        assert_matches!(
            commander.dispatch("w1", Value::Null, None),
            Err(DispatchError::SendFailed(_))
        );
    }

    #[test]
    fn response_frames_reach_handler() {
        let (registry, commander) = setup();
        let (w, _rx) = worker(&registry, "w1");
        let recorder = Recorder::default();

        let outcome = commander.handle_inbound_worker_frame(
            &w,
            r#"{"type":"node_response","requestId":"r1","response":{"x":1}}"#,
            &recorder,
        );
        assert_eq!(outcome, WorkerFrameOutcome::Response);

        let outcome = commander.handle_inbound_worker_frame(
            &w,
            r#"{"type":"commandResponse","requestId":"r2"}"#,
            &recorder,
        );
        assert_eq!(outcome, WorkerFrameOutcome::Response);

        let seen = recorder.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "w1");
        assert_eq!(seen[0].1.request_id.as_deref(), Some("r1"));
        assert_eq!(seen[0].1.response, serde_json::json!({"x": 1}));
        assert_eq!(seen[1].1.response, serde_json::json!({}));
    }

    #[test]
    fn other_frames_are_ignored() {
        let (registry, commander) = setup();
        let (w, _rx) = worker(&registry, "w1");
        let recorder = Recorder::default();

        assert_eq!(
            commander.handle_inbound_worker_frame(&w, r#"{"type":"status"}"#, &recorder),
            WorkerFrameOutcome::Ignored(Some("status".into()))
        );
        assert_eq!(
            commander.handle_inbound_worker_frame(&w, r#"{"no_type":true}"#, &recorder),
            WorkerFrameOutcome::Ignored(None)
        );
        assert_eq!(
            commander.handle_inbound_worker_frame(&w, "{{not json", &recorder),
            WorkerFrameOutcome::Malformed
        );
        assert!(recorder.seen.lock().is_empty());
        assert!(w.is_open());
    }

    #[test]
    fn targeted_frame_is_relayed_verbatim_to_peer() {
        let (registry, commander) = setup();
        let (sender, _sender_rx) = worker(&registry, "w1");
        let (_peer, mut peer_rx) = worker(&registry, "w2");
        let recorder = Recorder::default();

        let text = r#"{"type":"node_response","targetNodeId":"w2","requestId":"r1","payload":[1,2]}"#;
        assert_eq!(
            commander.handle_inbound_worker_frame(&sender, text, &recorder),
            WorkerFrameOutcome::Forwarded("w2".into())
        );
        assert_eq!(peer_rx.try_recv().unwrap().as_str(), text);
        assert!(recorder.seen.lock().is_empty());
    }

    #[test]
    fn targeted_frame_to_missing_or_closed_peer_is_dropped() {
        let (registry, commander) = setup();
        let (sender, mut sender_rx) = worker(&registry, "w1");
        let (peer, mut peer_rx) = worker(&registry, "w2");
        peer.connection().mark_closed();
        let recorder = Recorder::default();

        assert_eq!(
            commander.handle_inbound_worker_frame(
                &sender,
                r#"{"type":"chat","targetNodeId":"ghost"}"#,
                &recorder
            ),
            WorkerFrameOutcome::TargetUnavailable("ghost".into())
        );
        assert_eq!(
            commander.handle_inbound_worker_frame(
                &sender,
                r#"{"type":"node_response","targetNodeId":"w2","requestId":"r1"}"#,
                &recorder
            ),
            WorkerFrameOutcome::TargetUnavailable("w2".into())
        );
        assert!(peer_rx.try_recv().is_err());
        assert!(sender_rx.try_recv().is_err());
        assert!(recorder.seen.lock().is_empty());
        assert!(sender.is_open());
    }

    #[test]
    fn ping_with_target_is_not_relayed() {
        let (registry, commander) = setup();
        let (sender, _sender_rx) = worker(&registry, "w1");
        let (_peer, mut peer_rx) = worker(&registry, "w2");
        let recorder = Recorder::default();

        assert_eq!(
            commander.handle_inbound_worker_frame(
                &sender,
                r#"{"type":"ping","targetNodeId":"w2"}"#,
                &recorder
            ),
            WorkerFrameOutcome::Ignored(Some("ping".into()))
        );
        assert!(peer_rx.try_recv().is_err());
    }
}
