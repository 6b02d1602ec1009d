//! Session-manager interface and the subsystem event bus.
//!
//! The session store itself is an external collaborator; the dispatcher
//! only needs `get`/`destroy` and the side-band event bus it provides for
//! dispatcher↔listener control traffic (ping, ping-response, cleanup).

use std::sync::Arc;

use async_trait::async_trait;
use sockethub_proto::{Session, SessionId};
use tokio::sync::broadcast;

/// Session store failure.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session resolution failed: {0}")]
    Resolve(String),
}

/// Control event on the subsystem bus.
#[derive(Clone, Debug)]
pub enum SubsystemEvent {
    /// Liveness probe. Dispatcher-originated pings carry no actor;
    /// listener-originated pings carry the listener's platform.
    Ping {
        timestamp: i64,
        enc_key: String,
        actor_platform: Option<String>,
    },
    /// A listener answering a probe.
    PingResponse { actor_platform: String },
    /// Sessions being torn down; listeners drop any state they hold.
    Cleanup { sids: Vec<SessionId> },
}

/// Broadcast side-band bus shared between the dispatcher and platform
/// listeners. Provided by the session manager.
#[derive(Clone)]
pub struct Subsystem {
    tx: broadcast::Sender<SubsystemEvent>,
}

impl Subsystem {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast an event; returns the number of live subscribers.
    pub fn send(&self, event: SubsystemEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubsystemEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Subsystem {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Per-session state store (external collaborator).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Resolve the session handle for `sid`, creating it if needed.
    /// Resolution is asynchronous; inbound frames buffer until it
    /// completes.
    async fn get(&self, sid: SessionId) -> Result<Arc<dyn Session>, SessionError>;

    /// Destroy the session and its stored state.
    async fn destroy(&self, sid: SessionId) -> Result<(), SessionError>;

    /// The subsystem event bus this store hosts.
    fn subsystem(&self) -> &Subsystem;
}
