//! Shutdown coordination for the dispatcher's background tasks.
//!
//! One `CancellationToken` is both the shutdown signal and the
//! in-shutdown flag the ingress pipeline checks. Tracked tasks are
//! classified so teardown can drain them in dependency order: liveness
//! tasks die on cancellation, delayed destroys finish their grace sleep,
//! connection loops flush frames already submitted, and egress pumps —
//! which only exit when a disconnect sentinel reaches their channel —
//! are aborted if they are still blocked at the deadline.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wait budget for draining tasks before aborting the stragglers.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Classes of dispatcher background task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    /// Subsystem ping listener and readiness retries; cancellation ends
    /// them immediately.
    Liveness,
    /// Delayed session destroys; they complete once the drain grace
    /// elapses.
    Destroy,
    /// Per-connection ingress loops; they end when the transport drops
    /// the connection handle.
    Connection,
    /// Per-session egress pumps. A pump only exits on its disconnect
    /// sentinel, so one still blocked at the deadline is aborted rather
    /// than awaited.
    Pump,
}

/// Drain order. Destroys go early so session state is released while
/// connection loops are still flushing; pumps go last because a pump
/// whose connection never closed has no sentinel coming.
const DRAIN_ORDER: [TaskKind; 4] = [
    TaskKind::Liveness,
    TaskKind::Destroy,
    TaskKind::Connection,
    TaskKind::Pump,
];

struct Tracked {
    kind: TaskKind,
    handle: JoinHandle<()>,
}

/// Tracks the dispatcher's background tasks and coordinates their
/// shutdown.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracked: Mutex<Vec<Tracked>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracked: Mutex::new(Vec::new()),
        }
    }

    /// Track a background task under its class.
    pub fn register(&self, kind: TaskKind, handle: JoinHandle<()>) {
        self.tracked.lock().push(Tracked { kind, handle });
    }

    /// Tracked tasks of `kind`. Finished tasks stay counted until the
    /// next shutdown drain.
    pub fn tracked_count(&self, kind: TaskKind) -> usize {
        self.tracked.lock().iter().filter(|t| t.kind == kind).count()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Flip into shutdown: liveness retries abort and the ingress
    /// pipeline starts dropping inbound frames. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// [`Self::shutdown`] plus a bounded, class-ordered drain of every
    /// tracked task.
    ///
    /// The whole drain shares one deadline; a class that overruns eats
    /// into the budget of the classes after it, and whatever is still
    /// running at the deadline is aborted. Connection teardowns that run
    /// during the drain may register fresh destroy tasks; those are
    /// swept up at the end.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) {
        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        self.shutdown();

        let mut tasks = std::mem::take(&mut *self.tracked.lock());
        info!(task_count = tasks.len(), "draining dispatcher tasks");

        for kind in DRAIN_ORDER {
            let (batch, rest): (Vec<Tracked>, Vec<Tracked>) =
                tasks.into_iter().partition(|t| t.kind == kind);
            tasks = rest;
            if batch.is_empty() {
                continue;
            }
            debug!(?kind, count = batch.len(), "draining task class");
            drain(batch, deadline).await;
        }

        let late = std::mem::take(&mut *self.tracked.lock());
        if !late.is_empty() {
            debug!(count = late.len(), "draining late-registered tasks");
            drain(late, deadline).await;
        }

        info!("dispatcher shutdown complete");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Await each task until `deadline`; abort whatever misses it. A spent
/// budget still joins tasks that have already finished.
async fn drain(batch: Vec<Tracked>, deadline: Instant) {
    for task in batch {
        let budget = deadline.saturating_duration_since(Instant::now());
        let abort = task.handle.abort_handle();
        if tokio::time::timeout(budget, task.handle).await.is_err() {
            warn!(kind = ?task.kind, "task missed the shutdown deadline, aborted");
            abort.abort();
        }
    }
}
