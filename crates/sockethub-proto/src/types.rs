//! Wire-format types matching the client socket protocol.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Verb carried by confirm frames and by validation-error frames.
pub const CONFIRM_VERB: &str = "confirm";

/// Exact payload pushed onto a session's outgoing channel to terminate its
/// egress pump. Compared byte-for-byte; never forwarded to the client.
pub const DISCONNECT_SENTINEL: &str =
    r#"{"platform":"dispatcher","verb":"disconnect","status":true}"#;

/// Client-chosen request id, echoed verbatim in every response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rid {
    /// String form (`"rid": "abc"`).
    Str(String),
    /// Numeric form (`"rid": 42`).
    Num(serde_json::Number),
}

impl Rid {
    /// Extract a rid from a request field. `None` for any other JSON type.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Number(n) => Some(Self::Num(n.clone())),
            _ => None,
        }
    }
}

impl From<&str> for Rid {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<u64> for Rid {
    fn from(n: u64) -> Self {
        Self::Num(n.into())
    }
}

/// Per-connection session identifier.
///
/// Allocated from wall-clock millis mixed with a strictly-monotonic
/// process-wide counter, so two connections opened within the same
/// millisecond never collide. Injected into dispatched requests as a
/// decimal string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Confirm frame: `{rid, verb: "confirm", status: true}`.
///
/// Emitted exactly once per well-formed request, before any downstream
/// response for the same rid.
#[derive(Clone, Debug, Serialize)]
pub struct ConfirmFrame {
    pub rid: Rid,
    pub verb: &'static str,
    pub status: bool,
}

impl ConfirmFrame {
    pub fn new(rid: Rid) -> Self {
        Self {
            rid,
            verb: CONFIRM_VERB,
            status: true,
        }
    }
}

/// Message frame carrying a handler or listener response back to the client.
#[derive(Clone, Debug, Serialize)]
pub struct MessageFrame {
    pub rid: Rid,
    pub verb: String,
    pub platform: String,
    pub status: bool,
    pub object: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<Value>,
}

impl MessageFrame {
    /// Response frame for a completed request, echoing its identity and
    /// normalized target.
    pub fn reply(request: &VerbRequest, object: Value) -> Self {
        Self {
            rid: request.rid.clone(),
            verb: request.verb.clone(),
            platform: request.platform.clone(),
            status: true,
            object,
            target: request.target().to_vec(),
        }
    }
}

/// Error frame: `{rid, platform, verb, status: false, message, ...}`.
///
/// Identity fields are preserved as far as they were determined before the
/// failure; undetermined fields serialize as `null`.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorFrame {
    pub rid: Option<Rid>,
    pub platform: Option<String>,
    pub verb: String,
    pub status: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<Value>,
}

impl ErrorFrame {
    /// Error for a frame that failed JSON parsing; no identity was
    /// determinable.
    pub fn parse_failure(message: impl Into<String>) -> Self {
        Self {
            rid: None,
            platform: None,
            verb: CONFIRM_VERB.to_owned(),
            status: false,
            message: message.into(),
            object: None,
            target: Vec::new(),
        }
    }

    /// Error from the ingress validation chain. Carries whatever identity
    /// had been determined when the failing rule ran.
    pub fn validation(rid: Option<Rid>, platform: Option<String>, message: String) -> Self {
        Self {
            rid,
            platform,
            verb: CONFIRM_VERB.to_owned(),
            status: false,
            message,
            object: None,
            target: Vec::new(),
        }
    }

    /// Schema-validation error; the full request identity is known and the
    /// normalized target is echoed.
    pub fn schema(request: &VerbRequest, message: String) -> Self {
        Self {
            rid: Some(request.rid.clone()),
            platform: Some(request.platform.clone()),
            verb: request.verb.clone(),
            status: false,
            message,
            object: None,
            target: request.target().to_vec(),
        }
    }

    /// Error reported by a local verb handler, echoing the request identity.
    pub fn handler(request: &VerbRequest, message: String, object: Option<Value>) -> Self {
        Self {
            rid: Some(request.rid.clone()),
            platform: Some(request.platform.clone()),
            verb: request.verb.clone(),
            status: false,
            message,
            object,
            target: request.target().to_vec(),
        }
    }
}

/// Split a parsed inbound value into a batch of request entries.
///
/// If the value's element at index 0 is an object the whole value is the
/// batch; anything else is wrapped as a singleton batch.
pub fn split_batch(value: Value) -> Vec<Value> {
    match value {
        Value::Array(entries) if entries.first().is_some_and(Value::is_object) => entries,
        other => vec![other],
    }
}

/// A validated, normalized verb request.
///
/// `target` is always an ordered sequence (empty if absent) and `object`
/// always a map. Any extra fields from the original request (e.g. `actor`)
/// are kept intact for schema validation and queue forwarding.
#[derive(Clone, Debug)]
pub struct VerbRequest {
    pub rid: Rid,
    pub platform: String,
    pub verb: String,
    value: Map<String, Value>,
}

impl VerbRequest {
    /// Build from a shape-checked request object, normalizing `target` and
    /// `object` in place.
    pub fn normalize(mut value: Map<String, Value>, rid: Rid, platform: String, verb: String) -> Self {
        let target = match value.remove("target") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(seq)) => seq,
            Some(single) => vec![single],
        };
        value.insert("target".to_owned(), Value::Array(target));

        if !value.get("object").is_some_and(Value::is_object) {
            value.insert("object".to_owned(), Value::Object(Map::new()));
        }

        Self {
            rid,
            platform,
            verb,
            value,
        }
    }

    /// The normalized target sequence.
    pub fn target(&self) -> &[Value] {
        match self.value.get("target") {
            Some(Value::Array(seq)) => seq,
            _ => &[],
        }
    }

    /// The normalized object map.
    pub fn object(&self) -> &Value {
        self.value.get("object").unwrap_or(&Value::Null)
    }

    /// Inject the owning session id as a decimal string. The field is
    /// reserved: client-supplied values are rejected before this runs.
    pub fn set_session_id(&mut self, sid: SessionId) {
        self.value
            .insert("sessionId".to_owned(), Value::String(sid.to_string()));
    }

    /// The injected session id, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.value.get("sessionId").and_then(Value::as_str)
    }

    /// The full normalized request as a JSON value.
    pub fn as_value(&self) -> Value {
        Value::Object(self.value.clone())
    }

    /// Serialize for a queue push.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.value)
    }
}
