//! Dispatcher configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the dispatcher core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Milliseconds between liveness scans.
    pub listener_interval_ms: u64,
    /// Maximum number of liveness scans before readiness resolves.
    pub listener_interval_count: u32,
    /// Loaded platform names (allow-list). `dispatcher` is always
    /// implicitly allowed and need not appear here.
    pub platforms: Vec<String>,
    /// Seconds to wait after connection close before destroying the
    /// session, so in-flight responses can drain.
    pub destroy_grace_secs: u64,
    /// Per-connection inbound frame buffer.
    pub intake_buffer: usize,
}

impl DispatcherConfig {
    pub fn listener_interval(&self) -> Duration {
        Duration::from_millis(self.listener_interval_ms)
    }

    pub fn destroy_grace(&self) -> Duration {
        Duration::from_secs(self.destroy_grace_secs)
    }

    /// Whether `platform` may be dispatched to. `dispatcher` itself is
    /// always allowed.
    pub fn is_loaded(&self, platform: &str) -> bool {
        platform == "dispatcher" || self.platforms.iter().any(|p| p == platform)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listener_interval_ms: 1_000,
            listener_interval_count: 10,
            platforms: Vec::new(),
            destroy_grace_secs: 5,
            intake_buffer: 256,
        }
    }
}
