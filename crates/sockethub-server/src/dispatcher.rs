//! The dispatcher facade: admission, liveness init, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use sockethub_proto::{ProtocolRegistry, SessionId};
use tokio::sync::mpsc;
use tracing::{info, instrument};

use crate::config::DispatcherConfig;
use crate::connection::{allocate_session_id, ClientConnection, IncomingFrame, OutboundFrame};
use crate::liveness::{self, ReadinessError};
use crate::metrics::CONNECTIONS_TOTAL;
use crate::queue::{outgoing_channel, MessageQueue};
use crate::session::SessionStore;
use crate::shutdown::{ShutdownCoordinator, TaskKind};
use crate::{egress, ingress};

/// Shared dispatcher state handed to per-connection tasks.
pub(crate) struct DispatcherInner {
    pub(crate) config: DispatcherConfig,
    pub(crate) sockethub_id: String,
    pub(crate) registry: Arc<ProtocolRegistry>,
    pub(crate) queue: Arc<dyn MessageQueue>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) shutdown: ShutdownCoordinator,
}

/// The request/response multiplexer.
///
/// One instance per process. The transport calls [`Dispatcher::connect`]
/// per accepted socket and feeds frames through the returned
/// [`ConnectionHandle`].
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        sockethub_id: impl Into<String>,
        registry: Arc<ProtocolRegistry>,
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                sockethub_id: sockethub_id.into(),
                registry,
                queue,
                store,
                shutdown: ShutdownCoordinator::new(),
            }),
        }
    }

    /// Bind to the subsystem bus, ping the remote platforms this
    /// dispatcher owns, and resolve once all of them have responded
    /// within the retry budget.
    ///
    /// Failure is advisory: the dispatcher stays operational and requests
    /// for unresponsive platforms are rejected at ingress.
    #[instrument(skip_all, fields(sockethub_id = %self.inner.sockethub_id))]
    pub async fn init(&self, my_platforms: &[String]) -> Result<(), ReadinessError> {
        let cancel = self.inner.shutdown.token();

        let listener = tokio::spawn(liveness::run_ping_listener(
            self.inner.registry.clone(),
            self.inner.store.subsystem().subscribe(),
            cancel.clone(),
        ));
        self.inner.shutdown.register(TaskKind::Liveness, listener);

        liveness::run_readiness(
            self.inner.registry.clone(),
            self.inner.store.subsystem().clone(),
            my_platforms.to_vec(),
            self.inner.config.listener_interval(),
            self.inner.config.listener_interval_count,
            liveness::generate_enc_key(),
            cancel,
        )
        .await
    }

    /// Admit a new client connection.
    ///
    /// Allocates a session id, starts the egress pump on the session's
    /// outgoing channel, and starts the ingress loop, which buffers
    /// frames until the session manager resolves the session.
    pub fn connect(&self, outbound: mpsc::Sender<OutboundFrame>) -> ConnectionHandle {
        let sid = allocate_session_id(chrono::Utc::now().timestamp_millis());
        let conn = Arc::new(ClientConnection::new(sid, outbound));
        counter!(CONNECTIONS_TOTAL).increment(1);
        info!(session_id = %sid, "client connected");

        let channel = outgoing_channel(&self.inner.sockethub_id, sid);
        let pump = tokio::spawn(egress::run_pump(
            self.inner.queue.clone(),
            channel,
            conn.clone(),
        ));
        self.inner.shutdown.register(TaskKind::Pump, pump);

        let (intake_tx, intake_rx) = mpsc::channel(self.inner.config.intake_buffer);
        let loop_task = tokio::spawn(ingress::run_connection(
            self.inner.clone(),
            conn,
            intake_rx,
        ));
        self.inner.shutdown.register(TaskKind::Connection, loop_task);

        ConnectionHandle {
            session_id: sid,
            intake: intake_tx,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_shutting_down()
    }

    /// Enter shutdown: the ingress pipeline starts dropping inbound
    /// frames, the liveness retries abort, and the dispatcher's subsystem
    /// subscriptions are released. Open connections are not force-closed.
    pub fn shutdown(&self) {
        info!("dispatcher shutdown initiated");
        self.inner.shutdown.shutdown();
    }

    /// [`Self::shutdown`] plus a bounded wait for background tasks.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) {
        self.inner.shutdown.graceful_shutdown(timeout).await;
    }
}

/// The frame was not accepted because the connection is gone.
#[derive(Debug, thiserror::Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// Transport-facing handle for one admitted connection.
///
/// Dropping (or [`ConnectionHandle::close`]) triggers teardown: cleanup
/// broadcast, egress-pump sentinel, and the delayed session destroy.
/// Frames already submitted are still processed first.
pub struct ConnectionHandle {
    session_id: SessionId,
    intake: mpsc::Sender<IncomingFrame>,
}

impl ConnectionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Submit an inbound frame. Applies backpressure when the intake
    /// buffer is full.
    pub async fn handle_frame(&self, frame: IncomingFrame) -> Result<(), ConnectionClosed> {
        self.intake.send(frame).await.map_err(|_| ConnectionClosed)
    }

    /// Close the connection.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use sockethub_proto::{PlatformDef, Session};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::timeout;

    use crate::queue::InMemoryQueue;
    use crate::session::{SessionError, SessionStore, Subsystem};

    struct StubSession {
        registered: AtomicBool,
    }

    impl Session for StubSession {
        fn is_registered(&self) -> bool {
            self.registered.load(Ordering::Relaxed)
        }

        fn send(&self, _frame: &Value) -> bool {
            true
        }
    }

    /// Store whose sessions resolve after an optional delay.
    struct StubStore {
        subsystem: Subsystem,
        resolve_delay: Duration,
        registered: bool,
        destroyed: parking_lot::Mutex<Vec<SessionId>>,
        resolved: AtomicUsize,
    }

    impl StubStore {
        fn new(registered: bool) -> Self {
            Self {
                subsystem: Subsystem::default(),
                resolve_delay: Duration::ZERO,
                registered,
                destroyed: parking_lot::Mutex::new(Vec::new()),
                resolved: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.resolve_delay = delay;
            self
        }
    }

    #[async_trait]
    impl SessionStore for StubStore {
        async fn get(&self, _sid: SessionId) -> Result<Arc<dyn Session>, SessionError> {
            if !self.resolve_delay.is_zero() {
                tokio::time::sleep(self.resolve_delay).await;
            }
            let _ = self.resolved.fetch_add(1, Ordering::Relaxed);
            Ok(Arc::new(StubSession {
                registered: AtomicBool::new(self.registered),
            }))
        }

        async fn destroy(&self, sid: SessionId) -> Result<(), SessionError> {
            self.destroyed.lock().push(sid);
            Ok(())
        }

        fn subsystem(&self) -> &Subsystem {
            &self.subsystem
        }
    }

    fn make_registry() -> Arc<ProtocolRegistry> {
        Arc::new(
            ProtocolRegistry::builder()
                .platform(PlatformDef::remote("xmpp").verb("send", json!({})))
                .build()
                .unwrap(),
        )
    }

    fn make_dispatcher(store: Arc<StubStore>) -> (Dispatcher, Arc<InMemoryQueue>) {
        let queue = Arc::new(InMemoryQueue::new());
        let config = DispatcherConfig {
            platforms: vec!["xmpp".into()],
            destroy_grace_secs: 0,
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(config, "hub", make_registry(), queue.clone(), store);
        (dispatcher, queue)
    }

    #[tokio::test]
    async fn connect_allocates_unique_session_ids() {
        let store = Arc::new(StubStore::new(true));
        let (dispatcher, _queue) = make_dispatcher(store);

        let mut seen = HashSet::new();
        for _ in 0..10 {
            let (tx, _rx) = mpsc::channel(8);
            let handle = dispatcher.connect(tx);
            assert!(seen.insert(handle.session_id()));
        }
    }

    #[tokio::test]
    async fn frames_before_resolution_replay_in_order() {
        let store = Arc::new(StubStore::new(true).with_delay(Duration::from_millis(100)));
        let (dispatcher, _queue) = make_dispatcher(store.clone());

        let (tx, mut rx) = mpsc::channel(64);
        let handle = dispatcher.connect(tx);

        // Submitted while the session is still resolving.
        for i in 0..3 {
            handle
                .handle_frame(IncomingFrame::Binary(vec![i]))
                .await
                .unwrap();
        }
        assert_eq!(store.resolved.load(Ordering::Relaxed), 0);

        // Echoes arrive in submission order once the session resolves.
        for i in 0..3 {
            match timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
                Some(OutboundFrame::Binary(bytes)) => assert_eq!(bytes, vec![i]),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(store.resolved.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn close_destroys_session_after_grace() {
        let store = Arc::new(StubStore::new(true));
        let (dispatcher, queue) = make_dispatcher(store.clone());

        let (tx, _rx) = mpsc::channel(8);
        let handle = dispatcher.connect(tx);
        let sid = handle.session_id();

        let mut events = store.subsystem.subscribe();
        handle.close();

        // Cleanup broadcast carries the session id.
        match timeout(Duration::from_secs(1), events.recv()).await.unwrap() {
            Ok(crate::session::SubsystemEvent::Cleanup { sids }) => {
                assert_eq!(sids, vec![sid]);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Zero grace in tests: destroy lands promptly.
        timeout(Duration::from_secs(1), async {
            loop {
                if store.destroyed.lock().contains(&sid) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // The sentinel terminated the pump, so the outgoing channel holds
        // nothing for the client.
        let channel = outgoing_channel("hub", sid);
        timeout(Duration::from_secs(1), async {
            while queue.depth(&channel) != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn shutdown_drops_inbound_frames() {
        let store = Arc::new(StubStore::new(true));
        let (dispatcher, _queue) = make_dispatcher(store);

        let (tx, mut rx) = mpsc::channel(8);
        let handle = dispatcher.connect(tx);

        // Let the session resolve, then shut down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.shutdown();
        assert!(dispatcher.is_shutting_down());

        handle
            .handle_frame(IncomingFrame::Binary(vec![9]))
            .await
            .unwrap();
        // No echo: the frame was dropped at ingress.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handle_frame_after_teardown_errors() {
        let store = Arc::new(StubStore::new(true));
        let (dispatcher, _queue) = make_dispatcher(store);

        let (tx, _rx) = mpsc::channel(8);
        let handle = dispatcher.connect(tx);

        // Aborting the connection tasks drops the intake receiver.
        dispatcher
            .graceful_shutdown(Some(Duration::from_millis(50)))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle
            .handle_frame(IncomingFrame::Text("{}".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn init_resolves_against_responding_listeners() {
        let store = Arc::new(StubStore::new(true));
        let queue = Arc::new(InMemoryQueue::new());
        let config = DispatcherConfig {
            platforms: vec!["xmpp".into()],
            listener_interval_ms: 50,
            listener_interval_count: 5,
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(config, "hub", make_registry(), queue, store.clone());

        // A listener that answers any ping it sees.
        let subsystem = store.subsystem.clone();
        let mut events = store.subsystem.subscribe();
        let responder = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if matches!(event, crate::session::SubsystemEvent::Ping { .. }) {
                    subsystem.send(crate::session::SubsystemEvent::PingResponse {
                        actor_platform: "xmpp".into(),
                    });
                }
            }
        });

        let result = timeout(
            Duration::from_secs(5),
            dispatcher.init(&["xmpp".to_owned()]),
        )
        .await
        .unwrap();
        assert!(result.is_ok());

        dispatcher.shutdown();
        responder.abort();
    }

    #[tokio::test]
    async fn init_rejects_when_listener_silent() {
        let store = Arc::new(StubStore::new(true));
        let queue = Arc::new(InMemoryQueue::new());
        let config = DispatcherConfig {
            platforms: vec!["xmpp".into()],
            listener_interval_ms: 20,
            listener_interval_count: 2,
            ..DispatcherConfig::default()
        };
        let dispatcher = Dispatcher::new(config, "hub", make_registry(), queue, store);

        let result = timeout(
            Duration::from_secs(5),
            dispatcher.init(&["xmpp".to_owned()]),
        )
        .await
        .unwrap();
        match result {
            Err(ReadinessError::Unresponsive { platforms }) => {
                assert_eq!(platforms, vec!["xmpp".to_owned()]);
            }
            other => panic!("expected unresponsive, got {other:?}"),
        }
        // Still operational: connections are admitted after a failed init.
        let (tx, _rx) = mpsc::channel(8);
        let _handle = dispatcher.connect(tx);
        assert!(!dispatcher.is_shutting_down());
    }
}
