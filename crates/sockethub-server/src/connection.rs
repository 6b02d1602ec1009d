//! Per-connection state: session-id allocation and the outbound channel to
//! the client's transport write task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use sockethub_proto::SessionId;
use tokio::sync::mpsc;

use crate::metrics::OUTBOUND_DROPS_TOTAL;

/// Frame received from a client connection.
#[derive(Clone, Debug)]
pub enum IncomingFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Frame bound for a client connection.
#[derive(Clone, Debug)]
pub enum OutboundFrame {
    Text(Arc<String>),
    Binary(Vec<u8>),
}

/// Process-wide connection counter; mixed into session ids so two
/// connections admitted within the same millisecond never collide.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocate a session id from wall-clock millis and the monotonic
/// connection counter.
#[allow(clippy::cast_sign_loss)]
pub fn allocate_session_id(now_ms: i64) -> SessionId {
    let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    SessionId(((now_ms.max(0) as u64) << 16) | (counter & 0xffff))
}

/// A connected client, owned by exactly one session.
pub struct ClientConnection {
    /// The session id this connection exclusively owns.
    pub id: SessionId,
    tx: mpsc::Sender<OutboundFrame>,
    pub connected_at: Instant,
    dropped_frames: AtomicU64,
}

impl ClientConnection {
    pub fn new(id: SessionId, tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            id,
            tx,
            connected_at: Instant::now(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Send a text frame. Returns `false` if the channel is full or
    /// closed, incrementing the drop counter.
    pub fn send_text(&self, payload: Arc<String>) -> bool {
        self.send(OutboundFrame::Text(payload))
    }

    /// Echo binary bytes back unchanged.
    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        self.send(OutboundFrame::Binary(bytes))
    }

    /// Serialize and send a frame struct.
    pub fn send_frame<T: serde::Serialize>(&self, frame: &T) -> bool {
        match serde_json::to_string(frame) {
            Ok(json) => self.send_text(Arc::new(json)),
            Err(_) => false,
        }
    }

    fn send(&self, frame: OutboundFrame) -> bool {
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            counter!(OUTBOUND_DROPS_TOTAL).increment(1);
            false
        }
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}
