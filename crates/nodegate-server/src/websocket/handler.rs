//! Per-connection session state machine.
//!
//! `Unidentified → Authenticated → Closed`. The first frame on an ordinary
//! connection must identify it as a worker or a batch caller; the
//! controller is admitted at connect time by its query token. Once
//! authenticated, every frame refreshes the registry activity time and is
//! dispatched on the connection's role.

use std::sync::Arc;

use metrics::counter;
use nodegate_core::ProtocolError;
use nodegate_core::constants::CLOSE_POLICY_VIOLATION;
use nodegate_core::protocol::{self, Identify, OutboundFrame};
use tracing::{debug, info, warn};

use crate::auth::{Authenticator, admin_token_matches};
use crate::commander::{NodeCommander, WorkerFrameOutcome};
use crate::metrics::PROTOCOL_ERRORS_TOTAL;
use crate::registry::{ConnectionRegistry, Identity, Role};
use crate::router::{Caller, CommandRouter};
use crate::websocket::connection::ClientConnection;

/// Where a connection is in its lifecycle.
#[derive(Clone, Debug)]
pub enum SessionState {
    /// Connected, no identification yet.
    Unidentified,
    /// Identified and registered.
    Authenticated(Arc<Identity>),
    /// Rejected or disconnected.
    Closed,
}

impl SessionState {
    /// The registered identity, once authenticated.
    pub fn identity(&self) -> Option<&Arc<Identity>> {
        match self {
            Self::Authenticated(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Whether the session loop should keep reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Keep the connection open.
    Continue,
    /// Stop reading; the connection is closing.
    Close,
}

/// Drives the session state machine for every connection.
pub struct SessionDispatcher {
    registry: Arc<ConnectionRegistry>,
    commander: Arc<NodeCommander>,
    router: Arc<CommandRouter>,
    authenticator: Arc<dyn Authenticator>,
    admin_token: Option<String>,
}

impl SessionDispatcher {
    /// Create a dispatcher.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        commander: Arc<NodeCommander>,
        router: Arc<CommandRouter>,
        authenticator: Arc<dyn Authenticator>,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            registry,
            commander,
            router,
            authenticator,
            admin_token,
        }
    }

    /// Initial state for a freshly accepted connection.
    ///
    /// A connection presenting the admin token claims the controller slot
    /// immediately. A wrong token, or a lost slot race, closes it with a
    /// policy-violation code.
    pub fn on_open(
        &self,
        connection: &Arc<ClientConnection>,
        admin_token: Option<&str>,
    ) -> SessionState {
        let Some(presented) = admin_token else {
            return SessionState::Unidentified;
        };
        if !admin_token_matches(self.admin_token.as_deref(), Some(presented)) {
            warn!(conn_id = %connection.id, "invalid admin token");
            let _ = connection.close(CLOSE_POLICY_VIOLATION, "Invalid admin token");
            return SessionState::Closed;
        }
        match self.registry.register_controller(connection.clone()) {
            Some(identity) => {
                identity.mark_authenticated();
                let _ = connection.send_frame(&OutboundFrame::Acknowledgement {
                    message: "Connected as test master".into(),
                });
                SessionState::Authenticated(identity)
            }
            None => SessionState::Closed,
        }
    }

    /// Handle one inbound text frame.
    pub fn on_frame(
        &self,
        state: &mut SessionState,
        connection: &Arc<ClientConnection>,
        text: &str,
    ) -> FrameOutcome {
        match state {
            SessionState::Closed => FrameOutcome::Close,
            SessionState::Unidentified => match self.identify(connection, text) {
                Ok(identity) => {
                    *state = SessionState::Authenticated(identity);
                    FrameOutcome::Continue
                }
                Err(e) => {
                    counter!(PROTOCOL_ERRORS_TOTAL, "code" => e.code()).increment(1);
                    warn!(conn_id = %connection.id, error = %e, "identification rejected");
                    let message = e.to_string();
                    let _ = connection.send_frame(&OutboundFrame::error(None, None, message.clone()));
                    let _ = connection.close(CLOSE_POLICY_VIOLATION, message);
                    *state = SessionState::Closed;
                    FrameOutcome::Close
                }
            },
            SessionState::Authenticated(identity) => {
                self.registry.touch(identity);
                self.dispatch_by_role(identity, text);
                FrameOutcome::Continue
            }
        }
    }

    fn identify(
        &self,
        connection: &Arc<ClientConnection>,
        text: &str,
    ) -> Result<Arc<Identity>, ProtocolError> {
        let frame = protocol::parse_frame(text)?;
        let identify = Identify::parse(&frame)?;
        let role = match &identify {
            Identify::Worker { .. } => Role::Worker,
            Identify::BatchCaller { .. } => Role::BatchCaller,
        };
        let id = identify.id();
        if !self
            .authenticator
            .authenticate(role, id, identify.token())
        {
            return Err(ProtocolError::AuthenticationFailed(id.to_owned()));
        }

        let identity = match role {
            Role::Worker => self.registry.register_worker(id, connection.clone()),
            _ => self.registry.register_batch_caller(id, connection.clone()),
        };
        identity.mark_authenticated();
        let _ = connection.send_frame(&OutboundFrame::Acknowledgement {
            message: format!("Identified as {role} {id}"),
        });
        info!(conn_id = %connection.id, %role, id, "connection identified");
        Ok(identity)
    }

    fn dispatch_by_role(&self, identity: &Arc<Identity>, text: &str) {
        match identity.role() {
            Role::Worker => {
                let outcome =
                    self.commander
                        .handle_inbound_worker_frame(identity, text, &*self.router);
                if let WorkerFrameOutcome::Ignored(Some(ty)) = outcome {
                    if ty == protocol::types::PING {
                        debug!(node_id = identity.id(), "ping");
                        let _ = identity.connection().send_frame(&OutboundFrame::Pong);
                    }
                }
            }
            Role::TestController => {
                let _ = self.router.handle_caller_frame(Caller::Controller, text);
            }
            Role::BatchCaller => {
                let _ = self
                    .router
                    .handle_caller_frame(Caller::BatchCaller(identity.id().to_owned()), text);
            }
            Role::UpstreamMasterLink => {
                warn!(id = identity.id(), "unexpected inbound frame on upstream link record");
            }
        }
    }

    /// Transport closed: drop the registry record.
    pub fn on_close(&self, state: &mut SessionState, connection: &ClientConnection) {
        connection.mark_closed();
        if let Some(identity) = self.registry.unregister(&connection.id) {
            info!(id = identity.id(), role = %identity.role(), "connection closed");
        }
        *state = SessionState::Closed;
    }
}
