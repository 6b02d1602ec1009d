//! Per-session egress pump: blocking-pop the session's outgoing channel
//! and forward each payload verbatim to the client connection.

use std::sync::Arc;

use metrics::counter;
use sockethub_proto::DISCONNECT_SENTINEL;
use tracing::{debug, instrument, warn};

use crate::connection::ClientConnection;
use crate::metrics::EGRESS_FRAMES_TOTAL;
use crate::queue::MessageQueue;

/// Run the pump until the disconnect sentinel arrives or the queue fails.
///
/// Payloads are forwarded byte-identical; the sentinel is consumed
/// silently and terminates the pump without reissuing the pop. Queue
/// errors are logged and terminate the pump — the connection is
/// considered lost and the pump is not restarted.
#[instrument(skip_all, fields(session_id = %conn.id, channel = %channel))]
pub(crate) async fn run_pump(
    queue: Arc<dyn MessageQueue>,
    channel: String,
    conn: Arc<ClientConnection>,
) {
    loop {
        match queue.blocking_pop(&channel).await {
            Ok(payload) => {
                if payload == DISCONNECT_SENTINEL {
                    debug!("disconnect sentinel received, stopping pump");
                    return;
                }
                counter!(EGRESS_FRAMES_TOTAL).increment(1);
                if !conn.send_text(Arc::new(payload)) {
                    warn!("failed to forward outgoing frame (client channel full or closed)");
                }
            }
            Err(error) => {
                warn!(%error, "outgoing channel pop failed, stopping pump");
                return;
            }
        }
    }
}
