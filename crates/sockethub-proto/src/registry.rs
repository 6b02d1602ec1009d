//! Protocol registry: platforms, verbs, schemas, and the routing table.
//!
//! The registry is immutable after [`RegistryBuilder::build`] except for the
//! per-platform ping timestamps, which the liveness subsystem owns. Reads
//! and writes of a single timestamp are atomic; no further locking is
//! needed because the responsiveness comparison is advisory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::Validator;
use serde_json::Value;

use crate::errors::{HandlerError, RegistryError};
use crate::types::VerbRequest;

/// Per-connection session handle owned by the session manager.
pub trait Session: Send + Sync {
    /// Whether the session has completed registration.
    fn is_registered(&self) -> bool;

    /// Send a frame directly to the session's client connection. Returns
    /// `false` when the connection is gone.
    fn send(&self, frame: &Value) -> bool;
}

/// Handler for a verb executed in-process.
///
/// `Ok(data)` becomes a message frame with `object = data`; `Err` becomes
/// an error frame echoing the request identity.
#[async_trait]
pub trait VerbHandler: Send + Sync {
    async fn handle(
        &self,
        request: &VerbRequest,
        session: &dyn Session,
    ) -> Result<Value, HandlerError>;
}

/// Where a verb executes: in-process or forwarded to a platform listener
/// over the queue.
#[derive(Clone)]
pub enum VerbRoute {
    /// Execute the handler in-process.
    Local(Arc<dyn VerbHandler>),
    /// Serialize the request and push it to the platform's incoming channel.
    Queue,
}

impl std::fmt::Debug for VerbRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local"),
            Self::Queue => f.write_str("Queue"),
        }
    }
}

/// A verb definition: compiled schema plus route.
pub struct VerbSpec {
    validator: Validator,
    route: VerbRoute,
}

impl VerbSpec {
    /// Validate a normalized request against the verb schema. Returns the
    /// validator's message on mismatch.
    pub fn validate(&self, request: &Value) -> Result<(), String> {
        self.validator
            .validate(request)
            .map_err(|error| error.to_string())
    }

    pub fn route(&self) -> &VerbRoute {
        &self.route
    }
}

/// Ping timestamps for one remote platform, millisecond wall-clock.
///
/// A platform is responsive iff `last_received >= last_sent` for the most
/// recent ping round; one that has never responded has `last_received == 0`.
#[derive(Debug, Default)]
pub struct PingState {
    last_sent: AtomicI64,
    last_received: AtomicI64,
}

impl PingState {
    /// Start a fresh liveness round: `last_sent = now`, `last_received = 0`.
    pub fn reset(&self, now_ms: i64) {
        self.last_sent.store(now_ms, Ordering::Relaxed);
        self.last_received.store(0, Ordering::Relaxed);
    }

    pub fn mark_sent(&self, now_ms: i64) {
        self.last_sent.store(now_ms, Ordering::Relaxed);
    }

    pub fn mark_received(&self, now_ms: i64) {
        self.last_received.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_sent(&self) -> i64 {
        self.last_sent.load(Ordering::Relaxed)
    }

    pub fn last_received(&self) -> i64 {
        self.last_received.load(Ordering::Relaxed)
    }

    /// Still waiting on a response for the current round.
    pub fn is_pending(&self) -> bool {
        self.last_received() < self.last_sent()
    }

    /// Has ever answered a ping.
    pub fn has_responded(&self) -> bool {
        self.last_received() > 0
    }
}

/// One platform: locality flag, verb table, and (for remote platforms)
/// ping state.
pub struct PlatformRecord {
    name: String,
    local: bool,
    verbs: HashMap<String, VerbSpec>,
    ping: Option<PingState>,
}

impl PlatformRecord {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local platforms execute in-process and are never pinged.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn verb(&self, verb: &str) -> Option<&VerbSpec> {
        self.verbs.get(verb)
    }

    pub fn has_verb(&self, verb: &str) -> bool {
        self.verbs.contains_key(verb)
    }

    /// Ping state; `None` for local platforms.
    pub fn ping(&self) -> Option<&PingState> {
        self.ping.as_ref()
    }
}

/// In-memory catalog of platforms and verbs, loaded once at startup.
pub struct ProtocolRegistry {
    platforms: HashMap<String, PlatformRecord>,
}

impl ProtocolRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn platform(&self, name: &str) -> Option<&PlatformRecord> {
        self.platforms.get(name)
    }

    /// All platform names, unordered.
    pub fn platform_names(&self) -> impl Iterator<Item = &str> {
        self.platforms.keys().map(String::as_str)
    }

    /// Routing entry for `(platform, verb)`, cloned out of the table.
    pub fn route(&self, platform: &str, verb: &str) -> Option<VerbRoute> {
        self.platforms
            .get(platform)?
            .verbs
            .get(verb)
            .map(|spec| spec.route.clone())
    }

    /// Record a ping (or ping response) heard from `platform`. Returns
    /// `false` when the platform is unknown or local, in which case the
    /// caller logs and ignores the event.
    pub fn mark_received(&self, platform: &str, now_ms: i64) -> bool {
        match self.platforms.get(platform).and_then(PlatformRecord::ping) {
            Some(ping) => {
                ping.mark_received(now_ms);
                true
            }
            None => false,
        }
    }

    /// Of `names`, the remote platforms still awaiting a ping response for
    /// the current round.
    pub fn pending_of(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|name| {
                self.platforms
                    .get(name.as_str())
                    .and_then(PlatformRecord::ping)
                    .is_some_and(PingState::is_pending)
            })
            .cloned()
            .collect()
    }

    /// Of `names`, the remote platforms (those that participate in the
    /// liveness protocol).
    pub fn remote_of(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|name| {
                self.platforms
                    .get(name.as_str())
                    .is_some_and(|p| !p.is_local())
            })
            .cloned()
            .collect()
    }
}

/// Declarative platform definition fed to the [`RegistryBuilder`].
pub struct PlatformDef {
    name: String,
    local: bool,
    verbs: Vec<(String, Value, Option<Arc<dyn VerbHandler>>)>,
}

impl PlatformDef {
    /// A remote platform whose verbs are forwarded to an out-of-process
    /// listener.
    pub fn remote(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: false,
            verbs: Vec::new(),
        }
    }

    /// A local platform; executes in-process, exempt from pings.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: true,
            verbs: Vec::new(),
        }
    }

    /// A queue-forwarded verb with its JSON schema.
    #[must_use]
    pub fn verb(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.verbs.push((name.into(), schema, None));
        self
    }

    /// A verb executed in-process by `handler`.
    #[must_use]
    pub fn handled_verb(
        mut self,
        name: impl Into<String>,
        schema: Value,
        handler: impl VerbHandler + 'static,
    ) -> Self {
        self.verbs.push((name.into(), schema, Some(Arc::new(handler))));
        self
    }
}

/// Builds a [`ProtocolRegistry`], compiling every verb schema.
#[derive(Default)]
pub struct RegistryBuilder {
    platforms: Vec<PlatformDef>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn platform(mut self, def: PlatformDef) -> Self {
        self.platforms.push(def);
        self
    }

    pub fn build(self) -> Result<ProtocolRegistry, RegistryError> {
        let mut platforms = HashMap::new();
        for def in self.platforms {
            let mut verbs = HashMap::new();
            for (verb, schema, handler) in def.verbs {
                let validator = jsonschema::validator_for(&schema).map_err(|error| {
                    RegistryError::SchemaCompile {
                        platform: def.name.clone(),
                        verb: verb.clone(),
                        detail: error.to_string(),
                    }
                })?;
                let route = match handler {
                    Some(h) => VerbRoute::Local(h),
                    None => VerbRoute::Queue,
                };
                verbs.insert(verb, VerbSpec { validator, route });
            }
            let record = PlatformRecord {
                name: def.name.clone(),
                local: def.local,
                verbs,
                ping: (!def.local).then(PingState::default),
            };
            if platforms.insert(def.name.clone(), record).is_some() {
                return Err(RegistryError::DuplicatePlatform(def.name));
            }
        }
        Ok(ProtocolRegistry { platforms })
    }
}
