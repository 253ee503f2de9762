//! WebSocket session lifecycle: handles a single connected peer from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use nodegate_core::ConnectionId;
use nodegate_core::constants::CLOSE_NORMAL;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::connection::ClientConnection;
use super::handler::{FrameOutcome, SessionDispatcher, SessionState};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

/// Close reason sent to every peer on shutdown.
pub const SHUTDOWN_REASON: &str = "Server shutting down";

/// How long the writer gets to flush a close frame after reading stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a WebSocket session for a connected peer.
///
/// 1. Admits the controller if `admin_token` was presented at connect time
/// 2. Feeds every text frame through the session state machine
/// 3. Forwards queued outbound frames, then any requested close frame
/// 4. Drops the registry record on disconnect
///
/// Cancelling `shutdown` closes the peer with 1000 whether or not it has
/// identified.
#[instrument(skip_all, fields(conn_id = %conn_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    conn_id: ConnectionId,
    dispatcher: Arc<SessionDispatcher>,
    admin_token: Option<String>,
    send_queue_capacity: usize,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(send_queue_capacity);
    let connection = Arc::new(ClientConnection::new(conn_id, send_tx));

    info!("peer connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    // Queued frames drain before a requested close frame goes out.
    let outbound_conn = connection.clone();
    let mut outbound = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_str().to_owned().into())).await.is_err() {
                        break;
                    }
                }
                () = outbound_conn.closed() => {
                    if let Some(request) = outbound_conn.take_close_request() {
                        let frame = CloseFrame {
                            code: request.code,
                            reason: request.reason.into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    }
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut state = dispatcher.on_open(&connection, admin_token.as_deref());

    if !matches!(state, SessionState::Closed) {
        loop {
            let next = tokio::select! {
                () = connection.closed() => break,
                () = shutdown.cancelled() => {
                    let _ = connection.close(CLOSE_NORMAL, SHUTDOWN_REASON);
                    break;
                }
                next = ws_rx.next() => next,
            };
            let text = match next {
                Some(Ok(Message::Text(t))) => t.as_str().to_owned(),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(s) => s.to_owned(),
                    Err(_) => {
                        debug!(len = data.len(), "received non-UTF8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "peer sent close frame");
                    break;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "read error");
                    break;
                }
                None => break,
            };
            if dispatcher.on_frame(&mut state, &connection, &text) == FrameOutcome::Close {
                break;
            }
        }
    }

    // A locally requested close frame is already queued for the writer.
    connection.mark_closed();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut outbound)
        .await
        .is_err()
    {
        outbound.abort();
    }
    dispatcher.on_close(&mut state, &connection);

    info!("peer disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AllowAll;
    use crate::commander::NodeCommander;
    use crate::registry::ConnectionRegistry;
    use crate::router::CommandRouter;
    use axum::Router;
    use axum::extract::ws::WebSocketUpgrade;
    use axum::routing::get;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;

    type Client =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    /// Serve one session route whose shutdown token is a child of `parent`.
    async fn serve_sessions(
        registry: Arc<ConnectionRegistry>,
        parent: CancellationToken,
    ) -> String {
        let commander = Arc::new(NodeCommander::new(registry.clone()));
        let router = Arc::new(CommandRouter::new(registry.clone(), commander.clone()));
        let dispatcher = Arc::new(SessionDispatcher::new(
            registry,
            commander,
            router,
            Arc::new(AllowAll),
            None,
        ));
        let app = Router::new().route(
            "/ws",
            get(move |ws: WebSocketUpgrade| {
                let dispatcher = dispatcher.clone();
                let token = parent.child_token();
                async move {
                    ws.on_upgrade(move |socket| {
                        run_ws_session(socket, ConnectionId::new(), dispatcher, None, 16, token)
                    })
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move { axum::serve(listener, app).await });
        format!("ws://{addr}/ws")
    }

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(
            Duration::from_secs(30),
            Duration::from_secs(1800),
        ))
    }

    async fn next_message(client: &mut Client) -> ClientMessage {
        tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error")
    }

    async fn expect_close(client: &mut Client) -> (u16, String) {
        loop {
            if let ClientMessage::Close(frame) = next_message(client).await {
                let frame = frame.expect("close frame without payload");
                return (u16::from(frame.code), frame.reason.as_str().to_owned());
            }
        }
    }

    #[tokio::test]
    async fn cancelled_token_closes_unidentified_peer() {
        let parent = CancellationToken::new();
        let url = serve_sessions(registry(), parent.clone()).await;
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        parent.cancel();

        let (code, reason) = expect_close(&mut client).await;
        assert_eq!(code, CLOSE_NORMAL);
        assert_eq!(reason, SHUTDOWN_REASON);
    }

    #[tokio::test]
    async fn cancelled_token_closes_identified_worker_and_unregisters() {
        let registry = registry();
        let parent = CancellationToken::new();
        let url = serve_sessions(registry.clone(), parent.clone()).await;
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let identify = json!({"type": "identify_rpa_node", "nodeId": "w1"}).to_string();
        client.send(ClientMessage::text(identify)).await.unwrap();
        let ClientMessage::Text(ack) = next_message(&mut client).await else {
            panic!("expected acknowledgement");
        };
        let ack: Value = serde_json::from_str(ack.as_str()).unwrap();
        assert_eq!(ack["type"], "acknowledgement");
        assert!(registry.lookup_by_id("w1").is_some());

        parent.cancel();

        let (code, reason) = expect_close(&mut client).await;
        assert_eq!(code, CLOSE_NORMAL);
        assert_eq!(reason, SHUTDOWN_REASON);
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.lookup_by_id("w1").is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker was not unregistered");
    }

    #[tokio::test]
    async fn peer_close_ends_session_and_unregisters() {
        let registry = registry();
        let url = serve_sessions(registry.clone(), CancellationToken::new()).await;
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let identify = json!({"type": "identify_rpa_node", "nodeId": "w2"}).to_string();
        client.send(ClientMessage::text(identify)).await.unwrap();
        let _ack = next_message(&mut client).await;
        assert_eq!(registry.worker_count(), 1);

        client.close(None).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.worker_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session did not clean up");
    }
}
