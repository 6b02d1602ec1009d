//! Platform-liveness protocol: periodic pings on the subsystem bus,
//! response correlation, and the bounded-retry readiness loop.

use std::sync::Arc;

use sockethub_proto::ProtocolRegistry;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::session::{Subsystem, SubsystemEvent};

/// Readiness did not resolve cleanly. Advisory: the dispatcher keeps
/// running, and requests for unresponsive platforms are rejected at
/// ingress.
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("platforms unresponsive after liveness retries: {}", platforms.join(", "))]
    Unresponsive { platforms: Vec<String> },

    #[error("liveness readiness cancelled by shutdown")]
    Cancelled,
}

/// Generate the ephemeral encryption key broadcast with pings. Derived
/// from time and randomness; an opaque correlation token, not a secret.
pub(crate) fn generate_enc_key() -> String {
    uuid::Uuid::now_v7().to_string()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Stamp `last_sent` for each named platform and broadcast one ping frame.
fn broadcast_ping(
    registry: &ProtocolRegistry,
    subsystem: &Subsystem,
    platforms: &[String],
    enc_key: &str,
    fresh_round: bool,
) {
    let now = now_ms();
    for name in platforms {
        if let Some(ping) = registry.platform(name).and_then(|p| p.ping()) {
            if fresh_round {
                ping.reset(now);
            } else {
                ping.mark_sent(now);
            }
        }
    }
    let delivered = subsystem.send(SubsystemEvent::Ping {
        timestamp: now,
        enc_key: enc_key.to_owned(),
        actor_platform: None,
    });
    debug!(delivered, platforms = platforms.len(), "ping broadcast");
}

/// Consume `ping` and `ping-response` events, stamping `last_received`
/// for the named platform. Unknown platforms are logged and ignored —
/// they may belong to another dispatcher instance.
#[instrument(skip_all)]
pub(crate) async fn run_ping_listener(
    registry: Arc<ProtocolRegistry>,
    mut events: broadcast::Receiver<SubsystemEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let platform = match event {
            Ok(SubsystemEvent::Ping {
                actor_platform: Some(platform),
                ..
            })
            | Ok(SubsystemEvent::PingResponse {
                actor_platform: platform,
            }) => platform,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "subsystem bus lagged, ping events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if registry.mark_received(&platform, now_ms()) {
            debug!(platform, "ping response recorded");
        } else {
            debug!(platform, "ping from unknown platform ignored");
        }
    }
}

/// Drive the readiness protocol for the remote platforms this dispatcher
/// owns.
///
/// Sends an initial ping round, then scans every `interval`. Platforms
/// with `last_received < last_sent` are pending; any pending platform
/// triggers a re-ping and another scan, up to `count` scans. Resolves
/// `Ok` once nothing is pending, otherwise fails with the stragglers
/// after the retry budget is spent.
#[instrument(skip_all, fields(platforms = my_platforms.len()))]
pub(crate) async fn run_readiness(
    registry: Arc<ProtocolRegistry>,
    subsystem: Subsystem,
    my_platforms: Vec<String>,
    interval: std::time::Duration,
    count: u32,
    enc_key: String,
    cancel: CancellationToken,
) -> Result<(), ReadinessError> {
    let remote = registry.remote_of(&my_platforms);
    if remote.is_empty() {
        info!("no remote platforms to ping, dispatcher ready");
        return Ok(());
    }

    broadcast_ping(&registry, &subsystem, &remote, &enc_key, true);

    for scan in 1..=count {
        tokio::select! {
            () = cancel.cancelled() => return Err(ReadinessError::Cancelled),
            () = tokio::time::sleep(interval) => {}
        }

        let pending = registry.pending_of(&remote);
        if pending.is_empty() {
            info!(scan, "all platform listeners responsive, dispatcher ready");
            return Ok(());
        }
        if scan < count {
            debug!(scan, pending = ?pending, "platforms still pending, re-pinging");
            broadcast_ping(&registry, &subsystem, &pending, &enc_key, false);
        }
    }

    let pending = registry.pending_of(&remote);
    warn!(
        pending = ?pending,
        "liveness readiness timed out; dispatcher may not function correctly"
    );
    Err(ReadinessError::Unresponsive {
        platforms: pending,
    })
}
