//! Error types and the ingress validation-chain messages.

use serde_json::Value;

// ── Validation-chain messages ───────────────────────────────────────
//
// These strings are part of the wire contract; clients match on them.

/// Inbound text frame was not parseable JSON.
pub const ERR_INVALID_JSON: &str = "invalid JSON received";
/// `rid` missing or neither string nor number.
pub const ERR_NO_RID: &str = "no rid (request ID) specified";
/// `platform` missing or not a string.
pub const ERR_NO_PLATFORM: &str = "no platform specified";
/// `verb` missing or not a string.
pub const ERR_NO_VERB: &str = "no verb (action) specified";
/// Client supplied the reserved `sessionId` field.
pub const ERR_RESERVED_SESSION_ID: &str = "cannot use name sessionId, reserved property";
/// Session has not completed registration and the verb is not `register`.
pub const ERR_NOT_REGISTERED: &str = "session not registered, cannot process verb";

/// Platform absent from the registry, or a remote platform that has never
/// answered a ping.
pub fn unknown_platform(platform: &str) -> String {
    format!("unknown platform received: {platform}")
}

/// Platform present in the registry but not in the loaded allow-list.
pub fn platform_not_loaded(platform: &str) -> String {
    format!("platform '{platform}' not loaded")
}

/// Verb not defined under the platform.
pub fn unknown_verb(verb: &str) -> String {
    format!("unknown verb received: {verb}")
}

/// Request failed its verb schema.
pub fn schema_mismatch(detail: &str) -> String {
    format!("unable to validate json against schema: {detail}")
}

/// Registry construction failure.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A verb schema did not compile.
    #[error("invalid schema for {platform}:{verb}: {detail}")]
    SchemaCompile {
        platform: String,
        verb: String,
        detail: String,
    },

    /// The same platform was defined twice.
    #[error("duplicate platform definition: {0}")]
    DuplicatePlatform(String),
}

/// Error returned by a local verb handler; rendered as an error frame
/// echoing the request identity.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Optional structured payload echoed in the error frame.
    pub object: Option<Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            object: None,
        }
    }

    #[must_use]
    pub fn with_object(mut self, object: Value) -> Self {
        self.object = Some(object);
        self
    }
}
