//! # sockethub-proto
//!
//! Wire-format types and the protocol registry for the sockethub dispatcher.
//!
//! - Request/response frame types matching the client WebSocket protocol
//! - Request-id (`rid`) handling: string or number, echoed verbatim
//! - [`ProtocolRegistry`]: platforms, verbs, per-verb JSON schemas, and the
//!   local-handler vs. queue-forward routing table
//! - Per-platform ping timestamps used by the liveness protocol
//!
//! [`ProtocolRegistry`]: registry::ProtocolRegistry

#![deny(unsafe_code)]

pub mod errors;
pub mod registry;
pub mod types;

pub use errors::{HandlerError, RegistryError};
pub use registry::{
    PingState, PlatformDef, PlatformRecord, ProtocolRegistry, RegistryBuilder, Session,
    VerbHandler, VerbRoute, VerbSpec,
};
pub use types::{
    split_batch, ConfirmFrame, ErrorFrame, MessageFrame, Rid, SessionId, VerbRequest,
    CONFIRM_VERB, DISCONNECT_SENTINEL,
};
