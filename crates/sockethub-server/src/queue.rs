//! Shared-queue abstraction and channel naming.
//!
//! Production deployments back this with a pooled Redis client; tests and
//! single-process setups use [`InMemoryQueue`]. Consumers block on a pop;
//! producers never block.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sockethub_proto::SessionId;
use tokio::sync::mpsc;

/// Channel the egress pump consumes for one session.
pub fn outgoing_channel(sockethub_id: &str, sid: SessionId) -> String {
    format!("sockethub:{sockethub_id}:dispatcher:outgoing:{sid}")
}

/// Channel a platform listener consumes.
pub fn listener_channel(sockethub_id: &str, platform: &str) -> String {
    format!("sockethub:{sockethub_id}:listener:{platform}:incoming")
}

/// Queue transport failure.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The channel is gone (consumer dropped or backend closed).
    #[error("queue channel closed: {0}")]
    Closed(String),

    /// Backend-reported error.
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// String-keyed message queue shared with platform listeners.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Push a payload onto `channel`. Never blocks on a consumer.
    async fn push(&self, channel: &str, payload: String) -> Result<(), QueueError>;

    /// Block until a payload is available on `channel`. Each session
    /// channel has exactly one consumer.
    async fn blocking_pop(&self, channel: &str) -> Result<String, QueueError>;
}

struct MemoryChannel {
    tx: mpsc::UnboundedSender<String>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    depth: Arc<std::sync::atomic::AtomicUsize>,
}

impl MemoryChannel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            depth: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }
}

impl Clone for MemoryChannel {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            depth: self.depth.clone(),
        }
    }
}

/// In-process queue keyed by channel name.
#[derive(Default)]
pub struct InMemoryQueue {
    channels: Mutex<HashMap<String, MemoryChannel>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> MemoryChannel {
        let mut channels = self.channels.lock();
        channels
            .entry(name.to_owned())
            .or_insert_with(MemoryChannel::new)
            .clone()
    }

    /// Number of payloads currently buffered on `channel`.
    pub fn depth(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map_or(0, |c| c.depth.load(std::sync::atomic::Ordering::Relaxed))
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn push(&self, channel: &str, payload: String) -> Result<(), QueueError> {
        let chan = self.channel(channel);
        chan.tx
            .send(payload)
            .map_err(|_| QueueError::Closed(channel.to_owned()))?;
        let _ = chan.depth.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    async fn blocking_pop(&self, channel: &str) -> Result<String, QueueError> {
        let chan = self.channel(channel);
        let mut rx = chan.rx.lock().await;
        let payload = rx
            .recv()
            .await
            .ok_or_else(|| QueueError::Closed(channel.to_owned()))?;
        let _ = chan.depth.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        Ok(payload)
    }
}
