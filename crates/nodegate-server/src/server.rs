//! `GatewayServer`: axum HTTP + WebSocket relay and its background tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use nodegate_core::constants::{ADMIN_TOKEN_PARAM, CLOSE_NORMAL};
use nodegate_core::{ConnectionId, UpstreamError};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::auth::Authenticator;
use crate::commander::NodeCommander;
use crate::config::ServerConfig;
use crate::health::{self, HealthCounters, HealthResponse};
use crate::registry::ConnectionRegistry;
use crate::router::{Caller, CommandRouter};
use crate::shutdown::ShutdownCoordinator;
use crate::status_bridge::StatusBridge;
use crate::upstream::{MessageHandler, UpstreamClient};
use crate::websocket::handler::SessionDispatcher;
use crate::websocket::session::{SHUTDOWN_REASON, run_ws_session};

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session state machine shared by every connection.
    pub dispatcher: Arc<SessionDispatcher>,
    /// Live identities.
    pub registry: Arc<ConnectionRegistry>,
    /// Pending request table.
    pub router: Arc<CommandRouter>,
    /// Upstream link, if configured.
    pub upstream: Option<Arc<UpstreamClient>>,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
    /// Max inbound WebSocket message size.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Parent of every session's shutdown token.
    pub shutdown: CancellationToken,
}

/// The relay server.
pub struct GatewayServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<CommandRouter>,
    dispatcher: Arc<SessionDispatcher>,
    upstream: Option<Arc<UpstreamClient>>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    start_time: Instant,
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("upstream", &self.upstream)
            .field("shutting_down", &self.shutdown.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl GatewayServer {
    /// Wire the registry, commander, router, and optional upstream link.
    pub fn new(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, UpstreamError> {
        let registry = Arc::new(ConnectionRegistry::new(
            config.idle_timeout(),
            config.max_lifespan(),
        ));
        let commander = Arc::new(NodeCommander::new(registry.clone()));
        let router = Arc::new(CommandRouter::new(registry.clone(), commander.clone()));

        let upstream = match &config.upstream {
            Some(upstream_config) => {
                let client =
                    UpstreamClient::new(upstream_config.clone(), upstream_handler(&router))?;
                let _ = router.attach_upstream(client.clone());
                Some(client)
            }
            None => None,
        };

        let dispatcher = Arc::new(SessionDispatcher::new(
            registry.clone(),
            commander,
            router.clone(),
            authenticator,
            config.admin_token.clone(),
        ));

        Ok(Self {
            config,
            registry,
            router,
            dispatcher,
            upstream,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            tasks: Mutex::new(Vec::new()),
            start_time: Instant::now(),
        })
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            dispatcher: self.dispatcher.clone(),
            registry: self.registry.clone(),
            router: self.router.clone(),
            upstream: self.upstream.clone(),
            metrics: self.metrics.clone(),
            start_time: self.start_time,
            max_message_size: self.config.max_message_size,
            send_queue_capacity: self.config.send_queue_capacity,
            shutdown: self.shutdown.token(),
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .route("/", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(state)
    }

    /// Bind the listener and start the background tasks.
    ///
    /// Returns the bound address; the server runs until
    /// [`shutdown`](Self::shutdown).
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        let serve_token = token.clone();
        let serve = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "http server failed");
            }
        });

        let sweeper = self
            .registry
            .spawn_sweeper(self.config.sweep_interval(), token.clone());

        let mut tasks = vec![serve, sweeper];
        if let Some(upstream) = &self.upstream {
            let bridge = StatusBridge::new(self.registry.subscribe(), upstream.clone());
            tasks.push(tokio::spawn(bridge.run(token.clone())));
            upstream.connect().await;
        }
        self.tasks.lock().extend(tasks);

        info!(
            %addr,
            version = nodegate_core::constants::VERSION,
            upstream = self.config.upstream.as_ref().map(|u| u.url.as_str()),
            "gateway listening"
        );
        Ok(addr)
    }

    /// Stop accepting, close every peer, stop the upstream link, then wait
    /// (bounded) for the background tasks.
    ///
    /// Cancelling the coordinator token stops the listener and closes every
    /// session, including ones that never identified.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        self.shutdown.shutdown();
        self.registry.close_all(CLOSE_NORMAL, SHUTDOWN_REASON);
        if let Some(upstream) = &self.upstream {
            upstream.shutdown().await;
        }
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        let _ = self
            .shutdown
            .graceful_shutdown(handles, Some(self.config.shutdown_timeout()))
            .await;
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the command router.
    pub fn command_router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    /// Get the upstream link, if configured.
    pub fn upstream(&self) -> Option<&Arc<UpstreamClient>> {
        self.upstream.as_ref()
    }

    /// Get the shutdown coordinator.
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Frames from the upstream master are submissions on behalf of
/// [`Caller::Upstream`].
fn upstream_handler(router: &Arc<CommandRouter>) -> MessageHandler {
    let router: Weak<CommandRouter> = Arc::downgrade(router);
    Arc::new(move |text: String| {
        if let Some(router) = router.upgrade() {
            let _ = router.handle_caller_frame(Caller::Upstream, &text);
        }
    })
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let counters = HealthCounters {
        connections: state.registry.connection_count(),
        workers: state.registry.worker_count(),
        pending_requests: state.router.pending_count(),
        upstream_connected: state.upstream.as_ref().map(|u| u.is_connected()),
    };
    Json(health::health_check(state.start_time, counters))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws: upgrade and run the session loop.
///
/// `?adminToken=` on the upgrade request selects the controller path.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let admin_token = params.get(ADMIN_TOKEN_PARAM).cloned();
    let dispatcher = state.dispatcher.clone();
    let capacity = state.send_queue_capacity;
    let shutdown = state.shutdown.child_token();
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| {
            run_ws_session(
                socket,
                ConnectionId::new(),
                dispatcher,
                admin_token,
                capacity,
                shutdown,
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::config::UpstreamConfig;
    use assert_matches::assert_matches;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn make_server() -> GatewayServer {
        GatewayServer::new(ServerConfig::default(), Arc::new(AllowAll)).unwrap()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), 10_000)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or_default())
    }

    #[test]
    fn server_with_default_config() {
        let server = make_server();
        assert_eq!(server.config().host, "127.0.0.1");
        assert_eq!(server.config().port, 0);
        assert!(server.upstream().is_none());
        assert!(!server.shutdown_coordinator().is_shutting_down());
    }

    #[test]
    fn blank_upstream_url_is_rejected() {
        let config = ServerConfig {
            upstream: Some(UpstreamConfig::new("")),
            ..ServerConfig::default()
        };
        assert_matches!(
            GatewayServer::new(config, Arc::new(AllowAll)),
            Err(UpstreamError::MissingUrl)
        );
    }

    #[test]
    fn upstream_is_attached_when_configured() {
        let config = ServerConfig {
            upstream: Some(UpstreamConfig::new("ws://127.0.0.1:9")),
            ..ServerConfig::default()
        };
        let server = GatewayServer::new(config, Arc::new(AllowAll)).unwrap();
        assert!(server.upstream().is_some());
    }

    #[tokio::test]
    async fn health_endpoint_returns_counters() {
        let server = make_server();
        let (status, body) = get_json(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["workers"], 0);
        assert_eq!(body["pending_requests"], 0);
        assert!(body["upstream_connected"].is_null());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let server = make_server();
        let (status, _) = get_json(server.router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ws_route_requires_upgrade() {
        let server = make_server();
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = server.router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let (status, _) = get_json(server.router(), "/nonexistent").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_then_shutdown() {
        let server = make_server();
        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().await;
        assert!(server.shutdown_coordinator().is_shutting_down());
    }

    #[tokio::test]
    async fn listener_refuses_connections_after_shutdown() {
        let server = make_server();
        let addr = server.listen().await.unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());
        server.shutdown().await;
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[test]
    fn debug_shows_bind_target() {
        let rendered = format!("{:?}", make_server());
        assert!(rendered.contains("GatewayServer"));
        assert!(rendered.contains("127.0.0.1"));
        assert!(rendered.contains("shutting_down: false"));
    }
}
