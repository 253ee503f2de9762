//! Reconnecting client for the outbound link to an upstream master.
//!
//! `Disconnected → Connecting → Connected → Disconnected → (fixed delay) →
//! Connecting …`. One supervisor task owns the link: it connects, sends the
//! registration frame, pumps frames until the transport closes or errors,
//! then waits the fixed retry delay and starts over. Connect failures take
//! the same retry path as a post-connect close. Inbound frames are handed to
//! a caller-supplied handler; outbound frames are never buffered across a
//! disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use metrics::counter;
use nodegate_core::constants::CLOSE_NORMAL;
use nodegate_core::protocol::{NodeStatusReport, OutboundFrame};
use nodegate_core::{ConnectionId, UpstreamError};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::UpstreamConfig;
use crate::metrics::UPSTREAM_RECONNECTS_TOTAL;
use crate::websocket::connection::ClientConnection;

/// Outbound frames queued for the link writer.
const SEND_QUEUE_CAPACITY: usize = 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback for each text frame received from the upstream master.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Link state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// No transport.
    Disconnected,
    /// Transport being opened.
    Connecting,
    /// Transport open and registered.
    Connected,
}

struct Supervisor {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Outbound link to an upstream master with fixed-delay reconnect.
pub struct UpstreamClient {
    config: UpstreamConfig,
    handler: MessageHandler,
    state: Mutex<LinkState>,
    current: Mutex<Option<Arc<ClientConnection>>>,
    supervisor: Mutex<Option<Supervisor>>,
    retries: AtomicU64,
    cancel: CancellationToken,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("url", &self.config.url)
            .field("state", &self.state())
            .field("retries", &self.retries_scheduled())
            .finish_non_exhaustive()
    }
}

impl UpstreamClient {
    /// Create a client for `config.url`. Nothing connects until
    /// [`connect`](Self::connect).
    pub fn new(config: UpstreamConfig, handler: MessageHandler) -> Result<Arc<Self>, UpstreamError> {
        if config.url.trim().is_empty() {
            return Err(UpstreamError::MissingUrl);
        }
        Ok(Arc::new(Self {
            config,
            handler,
            state: Mutex::new(LinkState::Disconnected),
            current: Mutex::new(None),
            supervisor: Mutex::new(None),
            retries: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }))
    }

    /// (Re)start the link.
    ///
    /// An existing link is told to close and given a bounded wait before it
    /// is aborted. After [`shutdown`](Self::shutdown) this does nothing.
    pub async fn connect(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            debug!("upstream client shut down, not connecting");
            return;
        }
        self.stop_supervisor().await;

        let stop = self.cancel.child_token();
        let task = tokio::spawn(Arc::clone(self).supervise(stop.clone()));
        let replaced = self.supervisor.lock().replace(Supervisor { stop, task });
        if let Some(racing) = replaced {
            racing.stop.cancel();
        }
    }

    async fn stop_supervisor(&self) {
        let previous = self.supervisor.lock().take();
        let Some(Supervisor { stop, mut task }) = previous else {
            return;
        };
        stop.cancel();
        if tokio::time::timeout(self.config.close_timeout(), &mut task)
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.config.close_timeout_ms,
                "upstream link did not close in time, aborting"
            );
            task.abort();
        }
    }

    #[instrument(skip_all, name = "upstream", fields(url = %self.config.url))]
    async fn supervise(self: Arc<Self>, stop: CancellationToken) {
        loop {
            self.run_once(&stop).await;
            self.set_state(LinkState::Disconnected);
            if stop.is_cancelled() {
                break;
            }
            let _ = self.retries.fetch_add(1, Ordering::Relaxed);
            counter!(UPSTREAM_RECONNECTS_TOTAL).increment(1);
            info!(
                delay_ms = self.config.retry_delay_ms,
                "upstream link down, scheduling reconnect"
            );
            tokio::select! {
                () = stop.cancelled() => break,
                () = tokio::time::sleep(self.config.retry_delay()) => {}
            }
        }
        debug!("upstream supervisor stopped");
    }

    async fn run_once(&self, stop: &CancellationToken) {
        self.set_state(LinkState::Connecting);
        let attempt = tokio::select! {
            () = stop.cancelled() => return,
            attempt = tokio_tungstenite::connect_async(self.config.url.as_str()) => attempt,
        };
        match attempt {
            Ok((ws, _response)) => self.pump(ws, stop).await,
            Err(e) => {
                let err = UpstreamError::Connect {
                    url: self.config.url.clone(),
                    message: e.to_string(),
                };
                warn!(code = err.code(), error = %err, "upstream connect failed");
            }
        }
    }

    async fn pump(&self, ws: WsStream, stop: &CancellationToken) {
        let (mut sink, mut source) = ws.split();

        let register = OutboundFrame::MiddlemanRegister {
            server_id: self.server_id(),
        };
        match register.to_json() {
            Ok(json) => {
                if let Err(e) = sink.send(Message::text(json)).await {
                    warn!(error = %e, "failed to send registration frame");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize registration frame");
                return;
            }
        }

        let (tx, mut rx) = mpsc::channel::<Arc<String>>(SEND_QUEUE_CAPACITY);
        let connection = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
        *self.current.lock() = Some(connection.clone());
        self.set_state(LinkState::Connected);
        info!("connected to upstream master");

        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => {
                    let _ = sink.send(close_message(CLOSE_NORMAL, "Shutting down")).await;
                    break;
                }
                outbound = rx.recv() => {
                    let Some(text) = outbound else { break };
                    if let Err(e) = sink.send(Message::text(text.as_str().to_owned())).await {
                        let err = UpstreamError::Transport(e.to_string());
                        warn!(code = err.code(), error = %err, "upstream send failed");
                        break;
                    }
                }
                () = connection.closed() => {
                    if let Some(request) = connection.take_close_request() {
                        let _ = sink.send(close_message(request.code, &request.reason)).await;
                    }
                    break;
                }
                inbound = source.next() => match inbound {
                    Some(Ok(Message::Text(text))) => (self.handler)(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => (self.handler)(text.to_owned()),
                        Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "upstream master closed the link");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let err = UpstreamError::Transport(e.to_string());
                        warn!(code = err.code(), error = %err, "upstream read failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        connection.mark_closed();
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &connection)) {
            *current = None;
        }
    }

    fn server_id(&self) -> String {
        self.config.server_id.clone().unwrap_or_else(|| {
            format!("middleman-{}", chrono::Utc::now().timestamp_millis())
        })
    }

    fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Whether the link is open and registered.
    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Reconnect attempts scheduled so far.
    pub fn retries_scheduled(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Enqueue `frame` on the live link.
    pub fn try_send(&self, frame: &OutboundFrame) -> Result<(), UpstreamError> {
        let connection = self
            .current
            .lock()
            .clone()
            .filter(|_| self.is_connected())
            .ok_or(UpstreamError::NotConnected)?;
        if connection.send_frame(frame) {
            Ok(())
        } else {
            Err(UpstreamError::Transport("send queue full or closed".into()))
        }
    }

    /// Send `frame` if connected; otherwise log and drop it.
    pub fn send(&self, frame: &OutboundFrame) -> bool {
        match self.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(frame_type = frame.frame_type(), error = %e, "upstream frame not sent");
                false
            }
        }
    }

    /// Report a failed submission to the upstream master.
    pub fn send_error(
        &self,
        request_id: Option<&str>,
        node_id: Option<&str>,
        message: impl Into<String>,
    ) -> bool {
        self.send(&OutboundFrame::error(request_id, node_id, message))
    }

    /// Forward a worker response to the upstream master.
    pub fn forward_response(&self, node_id: &str, response: Value, request_id: &str) -> bool {
        self.send(&OutboundFrame::NodeResponse {
            request_id: request_id.to_owned(),
            node_id: node_id.to_owned(),
            response,
        })
    }

    /// Report a worker status change to the upstream master.
    pub fn report_node_status(&self, node_id: &str, status: NodeStatusReport) -> bool {
        self.send(&OutboundFrame::NodeStatus {
            node_id: node_id.to_owned(),
            status,
        })
    }

    /// Close the link and stop all future reconnects.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.stop_supervisor().await;
        self.set_state(LinkState::Disconnected);
        info!("upstream client stopped");
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: code.into(),
        reason: reason.to_owned().into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn config(url: String) -> UpstreamConfig {
        UpstreamConfig {
            url,
            retry_delay_ms: 50,
            close_timeout_ms: 500,
            server_id: Some("relay-test".into()),
        }
    }

    fn channel_handler() -> (MessageHandler, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |text| {
            let _ = tx.send(text);
        });
        (handler, rx)
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(t) => return t.as_str().to_owned(),
                Message::Close(_) => panic!("unexpected close"),
                _ => {}
            }
        }
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !f() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn empty_url_is_rejected() {
        let (handler, _rx) = channel_handler();
        assert_matches!(
            UpstreamClient::new(config("  ".into()), handler),
            Err(UpstreamError::MissingUrl)
        );
    }

    #[test]
    fn send_while_disconnected_is_dropped() {
        let (handler, _rx) = channel_handler();
        let client = UpstreamClient::new(config("ws://127.0.0.1:9".into()), handler).unwrap();
        assert_eq!(client.state(), LinkState::Disconnected);
        assert_matches!(
            client.try_send(&OutboundFrame::Pong),
            Err(UpstreamError::NotConnected)
        );
        assert!(!client.report_node_status("w1", NodeStatusReport::Connected));
    }

    #[tokio::test]
    async fn registers_then_relays_frames_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (handler, mut inbound) = channel_handler();
        let client = UpstreamClient::new(config(url), handler).unwrap();
        client.connect().await;

        let (stream, _) = listener.accept().await.unwrap();
        let mut master = tokio_tungstenite::accept_async(stream).await.unwrap();
        let register: Value = serde_json::from_str(&next_text(&mut master).await).unwrap();
        assert_eq!(
            register,
            serde_json::json!({"type": "middleman_register", "serverId": "relay-test"})
        );

        wait_until(|| client.is_connected()).await;
        assert!(client.forward_response("w1", serde_json::json!({"x": 1}), "r1"));
        let forwarded: Value = serde_json::from_str(&next_text(&mut master).await).unwrap();
        assert_eq!(forwarded["type"], "node_response");
        assert_eq!(forwarded["nodeId"], "w1");
        assert_eq!(forwarded["requestId"], "r1");

        assert!(client.send_error(Some("r2"), Some("w2"), "Node w2 not connected"));
        let error: Value = serde_json::from_str(&next_text(&mut master).await).unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["message"], "Node w2 not connected");

        master
            .send(Message::text(r#"{"type":"node_command"}"#.to_owned()))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, r#"{"type":"node_command"}"#);

        client.shutdown().await;
        assert_eq!(client.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn remote_close_schedules_one_retry_then_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (handler, _inbound) = channel_handler();
        let client = UpstreamClient::new(config(url), handler).unwrap();
        client.connect().await;

        let (stream, _) = listener.accept().await.unwrap();
        let mut first = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = next_text(&mut first).await;
        first.close(None).await.unwrap();
        drop(first);

        let (stream, _) = listener.accept().await.unwrap();
        let mut second = tokio_tungstenite::accept_async(stream).await.unwrap();
        let register: Value = serde_json::from_str(&next_text(&mut second).await).unwrap();
        assert_eq!(register["type"], "middleman_register");
        assert_eq!(client.retries_scheduled(), 1);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn refused_connection_keeps_retrying() {
        // bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (handler, _inbound) = channel_handler();
        let client = UpstreamClient::new(config(url), handler).unwrap();
        client.connect().await;

        wait_until(|| client.retries_scheduled() >= 3).await;
        assert!(!client.is_connected());

        client.shutdown().await;
        let after = client.retries_scheduled();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.retries_scheduled(), after);
    }

    #[tokio::test]
    async fn connect_after_shutdown_is_noop() {
        let (handler, _inbound) = channel_handler();
        let client = UpstreamClient::new(config("ws://127.0.0.1:9".into()), handler).unwrap();
        client.shutdown().await;
        client.connect().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.retries_scheduled(), 0);
        assert_eq!(client.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn explicit_reconnect_replaces_live_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (handler, _inbound) = channel_handler();
        let client = UpstreamClient::new(config(url), handler).unwrap();
        client.connect().await;

        let (stream, _) = listener.accept().await.unwrap();
        let mut first = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = next_text(&mut first).await;
        wait_until(|| client.is_connected()).await;

        client.connect().await;
        // the replaced link is closed with a close frame, not retried
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
        let (stream, _) = listener.accept().await.unwrap();
        let mut second = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = next_text(&mut second).await;
        assert_eq!(client.retries_scheduled(), 0);

        client.shutdown().await;
    }
}
