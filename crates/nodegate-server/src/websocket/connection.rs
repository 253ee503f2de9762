//! WebSocket client connection handle.
//!
//! A [`ClientConnection`] is the only way the rest of the relay touches a
//! transport. Sends are non-blocking enqueues onto the connection's writer
//! task; closing cancels a token the writer and reader both watch, so a
//! close never waits on an in-flight send.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nodegate_core::ConnectionId;
use nodegate_core::protocol::OutboundFrame;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Close code and reason requested for a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseRequest {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

/// Represents a connected WebSocket peer.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the connection's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// Cancelled once the connection is closing or closed.
    closed: CancellationToken,
    /// First close requested locally, consumed by the writer.
    close_request: Mutex<Option<CloseRequest>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Count of messages dropped due to full or closed channel.
    pub dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            tx,
            closed: CancellationToken::new(),
            close_request: Mutex::new(None),
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Send a text message to the peer.
    ///
    /// Returns `false` if the connection is closing, or the channel is full
    /// or closed, and increments the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if !self.closed.is_cancelled() && self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize an outbound frame and send it to the peer.
    pub fn send_frame(&self, frame: &OutboundFrame) -> bool {
        match frame.to_json() {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(conn_id = %self.id, frame_type = frame.frame_type(), error = %e, "failed to serialize frame");
                false
            }
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Request that the connection close with `code` and `reason`.
    ///
    /// Idempotent: only the first request is recorded, and later calls
    /// return `false`. Frames enqueued before the call are flushed ahead of
    /// the close frame.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        {
            let mut request = self.close_request.lock();
            if self.closed.is_cancelled() || request.is_some() {
                return false;
            }
            *request = Some(CloseRequest {
                code,
                reason: reason.into(),
            });
        }
        self.closed.cancel();
        true
    }

    /// Mark the transport as gone without requesting a close frame.
    pub fn mark_closed(&self) {
        self.closed.cancel();
    }

    /// Take the pending close request, if any.
    pub fn take_close_request(&self) -> Option<CloseRequest> {
        self.close_request.lock().take()
    }

    /// Whether the transport is still usable for sends.
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    /// Resolves once the connection starts closing.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection() -> (ClientConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(32);
        let conn = ClientConnection::new(ConnectionId::from("conn_1"), tx);
        (conn, rx)
    }

    #[test]
    fn create_connection() {
        let (conn, _rx) = make_connection();
        assert_eq!(conn.id.as_str(), "conn_1");
        assert!(conn.is_open());
        assert_eq!(conn.drop_count(), 0);
    }

    #[tokio::test]
    async fn send_message_success() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send(Arc::new("hello".into())));
        let msg = rx.recv().await.unwrap();
        assert_eq!(&*msg, "hello");
    }

    #[tokio::test]
    async fn send_to_closed_channel_returns_false() {
        let (conn, rx) = make_connection();
        drop(rx);
        assert!(!conn.send(Arc::new("hello".into())));
        assert!(!conn.is_open());
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_to_full_channel_returns_false() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ClientConnection::new(ConnectionId::from("conn_3"), tx);
        assert!(conn.send(Arc::new("msg1".into())));
        assert!(!conn.send(Arc::new("msg2".into())));
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn send_frame_serializes() {
        let (conn, mut rx) = make_connection();
        assert!(conn.send_frame(&OutboundFrame::Pong));
        let msg = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["type"], "pong");
    }

    #[test]
    fn close_is_idempotent() {
        let (conn, _rx) = make_connection();
        assert!(conn.close(1000, "bye"));
        assert!(!conn.close(1008, "again"));
        assert!(!conn.is_open());
        assert_eq!(
            conn.take_close_request(),
            Some(CloseRequest {
                code: 1000,
                reason: "bye".into()
            })
        );
        assert!(conn.take_close_request().is_none());
    }

    #[test]
    fn send_after_close_is_dropped() {
        let (conn, _rx) = make_connection();
        let _ = conn.close(1000, "");
        assert!(!conn.send(Arc::new("late".into())));
    }

    #[test]
    fn mark_closed_records_no_request() {
        let (conn, _rx) = make_connection();
        conn.mark_closed();
        assert!(!conn.is_open());
        assert!(conn.take_close_request().is_none());
        // a close after the transport is gone is a no-op
        assert!(!conn.close(1000, "late"));
    }

    #[tokio::test]
    async fn closed_future_resolves_on_close() {
        let (conn, _rx) = make_connection();
        let conn = Arc::new(conn);
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.closed().await })
        };
        let _ = conn.close(1000, "done");
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn connection_age_tracks_clock() {
        let (conn, _rx) = make_connection();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(conn.age() >= Duration::from_secs(90));
    }

    #[tokio::test]
    async fn send_multiple_messages_in_order() {
        let (conn, mut rx) = make_connection();
        for i in 0..5 {
            assert!(conn.send(Arc::new(format!("msg_{i}"))));
        }
        for i in 0..5 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(&*msg, &format!("msg_{i}"));
        }
    }
}
