//! Connection registry: identity, role, and idle/expiry bookkeeping for
//! every identified connection.
//!
//! Workers and batch callers live in separate id namespaces; each holds at
//! most one record per id and a duplicate registration force-closes the
//! previous transport. The controller occupies a single slot guarded by a
//! short check-and-set lock. Every record is also indexed by connection id
//! so a closing transport can be unregistered without knowing its role.
//!
//! All operations are individually atomic and idempotent: unregistering a
//! connection that is already gone returns `None`, and sweeping a record
//! that a concurrent close already removed is a silent no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use nodegate_core::ConnectionId;
use nodegate_core::constants::{CLOSE_NORMAL, CLOSE_POLICY_VIOLATION, CONTROLLER_ID};
use nodegate_core::protocol::NodeStatusReport;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::websocket::connection::ClientConnection;

/// Capacity of the worker lifecycle event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Close reason sent to the controller that lost the slot race.
pub const CONTROLLER_REJECTED_REASON: &str = "Only one test master is allowed.";

/// What a connection is allowed to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Remote agent that executes commands.
    Worker,
    /// Internal test harness admitted by shared secret.
    TestController,
    /// External batch-processing client.
    BatchCaller,
    /// Outbound link to an upstream master.
    UpstreamMasterLink,
}

impl Role {
    /// Lowercase label for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::TestController => "test_controller",
            Self::BatchCaller => "batch_caller",
            Self::UpstreamMasterLink => "upstream_master_link",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic status of an identified connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    /// Recently active; eligible for new commands.
    Active,
    /// Quiet past the idle threshold; not eligible for new commands.
    Idle,
}

#[derive(Debug)]
struct Activity {
    status: NodeStatus,
    last_activity: Instant,
}

/// Registry bookkeeping for one identified connection.
#[derive(Debug)]
pub struct Identity {
    id: String,
    role: Role,
    connection: Arc<ClientConnection>,
    activity: Mutex<Activity>,
    authenticated: AtomicBool,
}

impl Identity {
    fn new(id: impl Into<String>, role: Role, connection: Arc<ClientConnection>) -> Self {
        Self {
            id: id.into(),
            role,
            connection,
            activity: Mutex::new(Activity {
                status: NodeStatus::Active,
                last_activity: Instant::now(),
            }),
            authenticated: AtomicBool::new(false),
        }
    }

    /// Peer-chosen id (or the fixed controller id).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Role of this connection.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Transport handle.
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.connection
    }

    /// Current traffic status.
    pub fn status(&self) -> NodeStatus {
        self.activity.lock().status
    }

    /// Time since the last inbound frame.
    pub fn quiet_for(&self) -> Duration {
        self.activity.lock().last_activity.elapsed()
    }

    /// Time since the transport was accepted.
    pub fn age(&self) -> Duration {
        self.connection.age()
    }

    /// Whether the transport is still open.
    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Whether identification completed.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Record successful identification.
    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    /// Whether both handles refer to the same record.
    fn same(&self, other: &Identity) -> bool {
        std::ptr::eq(self, other)
    }
}

/// Worker lifecycle event, fanned out to the upstream status reporter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEvent {
    /// Worker id.
    pub node_id: String,
    /// New status.
    pub status: NodeStatusReport,
}

/// Outcome of one sweep pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records removed because their transport had already closed.
    pub removed_closed: usize,
    /// Records flipped from `Active` to `Idle`.
    pub marked_idle: usize,
    /// Records force-closed for exceeding the maximum lifespan.
    pub expired: usize,
}

impl SweepReport {
    /// Whether the pass changed nothing.
    pub fn is_empty(&self) -> bool {
        self.removed_closed == 0 && self.marked_idle == 0 && self.expired == 0
    }
}

/// Live connection identities indexed by id and by connection.
pub struct ConnectionRegistry {
    workers: DashMap<String, Arc<Identity>>,
    batch_callers: DashMap<String, Arc<Identity>>,
    by_connection: DashMap<ConnectionId, Arc<Identity>>,
    controller: Mutex<Option<Arc<Identity>>>,
    idle_timeout: Duration,
    max_lifespan: Duration,
    events: broadcast::Sender<NodeEvent>,
}

impl ConnectionRegistry {
    /// Create an empty registry with the given idle threshold and lifespan.
    pub fn new(idle_timeout: Duration, max_lifespan: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            workers: DashMap::new(),
            batch_callers: DashMap::new(),
            by_connection: DashMap::new(),
            controller: Mutex::new(None),
            idle_timeout,
            max_lifespan,
            events,
        }
    }

    /// Subscribe to worker lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, identity: &Identity, status: NodeStatusReport) {
        if identity.role == Role::Worker {
            let _ = self.events.send(NodeEvent {
                node_id: identity.id.clone(),
                status,
            });
        }
    }

    /// Register a worker under `id`, replacing any previous record.
    ///
    /// A previous record on a different connection has its transport closed
    /// before the map entry is replaced.
    pub fn register_worker(&self, id: &str, connection: Arc<ClientConnection>) -> Arc<Identity> {
        let identity = Arc::new(Identity::new(id, Role::Worker, connection));
        self.insert_replacing(&self.workers, &identity);
        info!(node_id = id, conn_id = %identity.connection.id, "worker registered");
        self.emit(&identity, NodeStatusReport::Connected);
        identity
    }

    /// Register a batch caller under `id`, replacing any previous record.
    pub fn register_batch_caller(
        &self,
        id: &str,
        connection: Arc<ClientConnection>,
    ) -> Arc<Identity> {
        let identity = Arc::new(Identity::new(id, Role::BatchCaller, connection));
        self.insert_replacing(&self.batch_callers, &identity);
        info!(client_id = id, conn_id = %identity.connection.id, "batch caller registered");
        identity
    }

    fn insert_replacing(&self, map: &DashMap<String, Arc<Identity>>, identity: &Arc<Identity>) {
        let replaced = match map.entry(identity.id.clone()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().clone();
                if previous.connection.id != identity.connection.id {
                    let _ = previous.connection.close(
                        CLOSE_NORMAL,
                        format!("Replaced by new connection for same nodeId: {}", identity.id),
                    );
                }
                let _ = entry.insert(identity.clone());
                Some(previous)
            }
            Entry::Vacant(entry) => {
                let _ = entry.insert(identity.clone());
                None
            }
        };
        if let Some(previous) = replaced {
            if previous.connection.id != identity.connection.id {
                let _ = self
                    .by_connection
                    .remove_if(&previous.connection.id, |_, v| v.same(&previous));
                info!(
                    id = %identity.id,
                    role = %identity.role,
                    old_conn = %previous.connection.id,
                    new_conn = %identity.connection.id,
                    "replaced existing connection for duplicate id"
                );
            }
        }
        let _ = self
            .by_connection
            .insert(identity.connection.id.clone(), identity.clone());
    }

    /// Claim the single controller slot for `connection`.
    ///
    /// Fails when the slot is held by an open connection; the new connection
    /// is then closed with a policy-violation code. A slot held by a closed
    /// connection is reclaimed.
    pub fn register_controller(&self, connection: Arc<ClientConnection>) -> Option<Arc<Identity>> {
        let mut slot = self.controller.lock();
        if let Some(existing) = slot.as_ref() {
            if existing.is_open() {
                drop(slot);
                warn!(conn_id = %connection.id, "rejecting second controller connection");
                let _ = connection.close(CLOSE_POLICY_VIOLATION, CONTROLLER_REJECTED_REASON);
                return None;
            }
            let stale = existing.clone();
            let _ = self
                .by_connection
                .remove_if(&stale.connection.id, |_, v| v.same(&stale));
        }
        let identity = Arc::new(Identity::new(
            CONTROLLER_ID,
            Role::TestController,
            connection,
        ));
        *slot = Some(identity.clone());
        drop(slot);
        let _ = self
            .by_connection
            .insert(identity.connection.id.clone(), identity.clone());
        info!(conn_id = %identity.connection.id, "controller registered");
        Some(identity)
    }

    /// Remove whatever record maps to `connection_id`.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<Arc<Identity>> {
        let (_, identity) = self.by_connection.remove(connection_id)?;
        match identity.role {
            Role::Worker => {
                if self
                    .workers
                    .remove_if(&identity.id, |_, v| v.same(&identity))
                    .is_some()
                {
                    self.emit(&identity, NodeStatusReport::Disconnected);
                }
            }
            Role::BatchCaller => {
                let _ = self
                    .batch_callers
                    .remove_if(&identity.id, |_, v| v.same(&identity));
            }
            Role::TestController | Role::UpstreamMasterLink => {
                let mut slot = self.controller.lock();
                if slot.as_ref().is_some_and(|c| c.same(&identity)) {
                    *slot = None;
                }
            }
        }
        debug!(id = %identity.id, role = %identity.role, conn_id = %connection_id, "unregistered");
        Some(identity)
    }

    /// Worker registered under `id`.
    pub fn lookup_by_id(&self, id: &str) -> Option<Arc<Identity>> {
        self.workers.get(id).map(|e| e.value().clone())
    }

    /// Batch caller registered under `id`.
    pub fn lookup_batch_caller(&self, id: &str) -> Option<Arc<Identity>> {
        self.batch_callers.get(id).map(|e| e.value().clone())
    }

    /// Record for `connection_id`, whatever its role.
    pub fn lookup_by_connection(&self, connection_id: &ConnectionId) -> Option<Arc<Identity>> {
        self.by_connection
            .get(connection_id)
            .map(|e| e.value().clone())
    }

    /// Current controller record.
    pub fn controller(&self) -> Option<Arc<Identity>> {
        self.controller.lock().clone()
    }

    /// Whether `connection_id` holds the controller slot.
    pub fn is_controller(&self, connection_id: &ConnectionId) -> bool {
        self.controller
            .lock()
            .as_ref()
            .is_some_and(|c| &c.connection.id == connection_id)
    }

    /// Mark a record `Active` and refresh its last-activity time.
    pub fn touch(&self, identity: &Identity) {
        let mut activity = identity.activity.lock();
        activity.status = NodeStatus::Active;
        activity.last_activity = Instant::now();
    }

    /// Workers whose transport is currently open, keyed by id.
    pub fn list_active(&self) -> HashMap<String, Arc<Identity>> {
        self.workers
            .iter()
            .filter(|e| e.value().is_open())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Close a worker's transport and remove its record.
    pub fn disconnect_by_id(&self, id: &str) -> bool {
        let Some(identity) = self.lookup_by_id(id) else {
            return false;
        };
        let _ = identity
            .connection
            .close(CLOSE_NORMAL, "Disconnected by server request");
        let _ = self.unregister(&identity.connection.id);
        info!(node_id = id, "worker disconnected by request");
        true
    }

    /// One sweep pass over every record.
    ///
    /// For each record, in order: a closed transport is unregistered; else an
    /// `Active` record quiet past the idle threshold becomes `Idle`; else a
    /// record older than the maximum lifespan is closed and unregistered.
    pub fn sweep(&self) -> SweepReport {
        let snapshot: Vec<Arc<Identity>> = self
            .by_connection
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut report = SweepReport::default();

        for identity in snapshot {
            if !identity.is_open() {
                if self.unregister(&identity.connection.id).is_some() {
                    report.removed_closed += 1;
                }
                continue;
            }

            let went_idle = {
                let mut activity = identity.activity.lock();
                if activity.status == NodeStatus::Active
                    && activity.last_activity.elapsed() > self.idle_timeout
                {
                    activity.status = NodeStatus::Idle;
                    true
                } else {
                    false
                }
            };

            if went_idle {
                debug!(id = %identity.id, role = %identity.role, "connection idle");
                self.emit(&identity, NodeStatusReport::Idle);
                report.marked_idle += 1;
            } else if identity.age() > self.max_lifespan {
                info!(id = %identity.id, role = %identity.role, "connection exceeded maximum lifespan");
                let _ = identity
                    .connection
                    .close(CLOSE_NORMAL, "Connection exceeded maximum lifespan");
                if self.unregister(&identity.connection.id).is_some() {
                    report.expired += 1;
                }
            }
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = registry.sweep();
                        if !report.is_empty() {
                            debug!(?report, "registry sweep");
                        }
                        if report.expired > 0 {
                            metrics::counter!(crate::metrics::SWEEP_EXPIRED_TOTAL)
                                .increment(u64::try_from(report.expired).unwrap_or(u64::MAX));
                        }
                    }
                }
            }
            debug!("registry sweeper stopped");
        })
    }

    /// Close every live transport.
    pub fn close_all(&self, code: u16, reason: &str) {
        for entry in &self.by_connection {
            let _ = entry.value().connection.close(code, reason);
        }
    }

    /// Number of identified connections.
    pub fn connection_count(&self) -> usize {
        self.by_connection.len()
    }

    /// Number of registered workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}
