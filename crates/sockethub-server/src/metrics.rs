//! Metric name constants recorded through the `metrics` facade.
//!
//! This crate only records; installing a recorder/exporter is the
//! embedder's job.

/// Requests entering the validation chain (counter, labels: platform, verb).
pub const INGRESS_REQUESTS_TOTAL: &str = "ingress_requests_total";
/// Requests rejected by validation or schema (counter, labels: reason).
pub const INGRESS_ERRORS_TOTAL: &str = "ingress_errors_total";
/// Requests forwarded to a platform listener channel (counter, labels: platform).
pub const QUEUE_PUSHES_TOTAL: &str = "queue_pushes_total";
/// Frames forwarded to clients by egress pumps (counter).
pub const EGRESS_FRAMES_TOTAL: &str = "egress_frames_total";
/// Outbound frames dropped because a client channel was full (counter).
pub const OUTBOUND_DROPS_TOTAL: &str = "outbound_drops_total";
/// Connections admitted (counter).
pub const CONNECTIONS_TOTAL: &str = "connections_total";
/// Connections torn down (counter).
pub const DISCONNECTS_TOTAL: &str = "disconnects_total";
