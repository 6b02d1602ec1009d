//! # sockethub-server
//!
//! The dispatcher core of the sockethub message bus: per-connection
//! session lifecycle, the ingress validation pipeline, fan-out to local
//! handlers or queue-forwarded platform listeners, per-session egress
//! pumps, and the platform-liveness protocol.
//!
//! The WebSocket transport, schema-catalog loader, session-state store,
//! and the production queue client are collaborators behind the traits in
//! [`queue`] and [`session`]; this crate contains everything in between.

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod dispatcher;
pub(crate) mod egress;
pub mod ingress;
pub mod liveness;
pub mod metrics;
pub mod queue;
pub mod session;
pub mod shutdown;

pub use config::DispatcherConfig;
pub use connection::{ClientConnection, IncomingFrame, OutboundFrame};
pub use dispatcher::{ConnectionClosed, ConnectionHandle, Dispatcher};
pub use liveness::ReadinessError;
pub use queue::{listener_channel, outgoing_channel, InMemoryQueue, MessageQueue, QueueError};
pub use session::{SessionError, SessionStore, Subsystem, SubsystemEvent};
pub use shutdown::{ShutdownCoordinator, TaskKind};

/// Install the dispatcher's tracing subscriber, writing compact records
/// to stderr.
///
/// `default_level` applies only when `RUST_LOG` is unset. Safe to call
/// repeatedly; installation happens at most once per process.
pub fn init_subscriber(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::new(default_level),
    };

    let _ = tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
