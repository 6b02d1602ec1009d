//! Per-connection ingress pipeline: pre-session buffering, the validation
//! chain, and dispatch to local handlers or platform listener channels.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use metrics::counter;
use serde_json::Value;
use sockethub_proto::errors::{
    self, ERR_INVALID_JSON, ERR_NOT_REGISTERED, ERR_NO_PLATFORM, ERR_NO_RID, ERR_NO_VERB,
    ERR_RESERVED_SESSION_ID,
};
use sockethub_proto::{
    split_batch, ConfirmFrame, ErrorFrame, HandlerError, MessageFrame, ProtocolRegistry, Rid,
    Session, VerbRequest, VerbRoute,
};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::DispatcherConfig;
use crate::connection::{ClientConnection, IncomingFrame};
use crate::dispatcher::DispatcherInner;
use crate::metrics::{DISCONNECTS_TOTAL, INGRESS_ERRORS_TOTAL, INGRESS_REQUESTS_TOTAL, QUEUE_PUSHES_TOTAL};
use crate::queue::{listener_channel, outgoing_channel};
use crate::session::{SessionError, SubsystemEvent};
use crate::shutdown::TaskKind;

/// The verb exempt from the registration gate.
const REGISTER_VERB: &str = "register";

type SessionFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn Session>, SessionError>> + Send>>;

/// Connection lifecycle phase.
///
/// `Buffering` holds frames that arrived before the session resolved;
/// `Active` processes frames through the validation chain; `Closing`
/// runs teardown.
enum ConnPhase {
    Buffering { pending: Vec<IncomingFrame> },
    Active { session: Arc<dyn Session> },
    Closing,
}

enum BufferingStep {
    Resolved(Result<Arc<dyn Session>, SessionError>),
    Frame(Option<IncomingFrame>),
}

/// Drive one connection from admission to teardown.
///
/// Frames are processed strictly in arrival order, including frames
/// buffered while the session was resolving. The intake channel closing
/// (transport dropped the handle) moves the connection to `Closing`.
#[instrument(skip_all, fields(session_id = %conn.id))]
pub(crate) async fn run_connection(
    inner: Arc<DispatcherInner>,
    conn: Arc<ClientConnection>,
    mut intake: mpsc::Receiver<IncomingFrame>,
) {
    let sid = conn.id;
    let store = inner.store.clone();
    let mut resolve: Option<SessionFuture> = Some(Box::pin(async move { store.get(sid).await }));
    let mut phase = ConnPhase::Buffering {
        pending: Vec::new(),
    };

    loop {
        phase = match phase {
            ConnPhase::Buffering { mut pending } => {
                let step = match resolve.as_mut() {
                    Some(fut) => tokio::select! {
                        result = fut.as_mut() => BufferingStep::Resolved(result),
                        frame = intake.recv() => BufferingStep::Frame(frame),
                    },
                    // Resolution already failed: keep buffering until close.
                    None => BufferingStep::Frame(intake.recv().await),
                };
                match step {
                    BufferingStep::Resolved(Ok(session)) => {
                        resolve = None;
                        debug!(buffered = pending.len(), "session resolved, replaying buffered frames");
                        for frame in pending.drain(..) {
                            process_frame(&inner, &conn, &session, frame).await;
                        }
                        ConnPhase::Active { session }
                    }
                    BufferingStep::Resolved(Err(error)) => {
                        resolve = None;
                        warn!(%error, "session resolution failed, connection stays pre-session");
                        ConnPhase::Buffering { pending }
                    }
                    BufferingStep::Frame(Some(frame)) => {
                        pending.push(frame);
                        ConnPhase::Buffering { pending }
                    }
                    BufferingStep::Frame(None) => {
                        if !pending.is_empty() {
                            warn!(
                                buffered = pending.len(),
                                "connection closed before session resolved, dropping buffered frames"
                            );
                        }
                        ConnPhase::Closing
                    }
                }
            }
            ConnPhase::Active { session } => match intake.recv().await {
                Some(frame) => {
                    process_frame(&inner, &conn, &session, frame).await;
                    ConnPhase::Active { session }
                }
                None => ConnPhase::Closing,
            },
            ConnPhase::Closing => break,
        };
    }

    teardown(&inner, &conn).await;
}

/// Handle one inbound frame on an active connection.
async fn process_frame(
    inner: &Arc<DispatcherInner>,
    conn: &Arc<ClientConnection>,
    session: &Arc<dyn Session>,
    frame: IncomingFrame,
) {
    if inner.shutdown.is_shutting_down() {
        debug!(session_id = %conn.id, "dispatcher in shutdown, dropping inbound frame");
        return;
    }
    match frame {
        // Placeholder behavior: binary payloads are echoed unchanged.
        IncomingFrame::Binary(bytes) => {
            let _ = conn.send_binary(bytes);
        }
        IncomingFrame::Text(text) => handle_text(inner, conn, session, &text).await,
    }
}

/// Parse, validate, confirm, and dispatch one inbound text frame.
async fn handle_text(
    inner: &Arc<DispatcherInner>,
    conn: &Arc<ClientConnection>,
    session: &Arc<dyn Session>,
    text: &str,
) {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(error) => {
            debug!(%error, "inbound frame is not valid JSON");
            counter!(INGRESS_ERRORS_TOTAL, "reason" => "parse").increment(1);
            let _ = conn.send_frame(&ErrorFrame::parse_failure(ERR_INVALID_JSON));
            return;
        }
    };

    for entry in split_batch(parsed) {
        match validate_entry(&inner.registry, &inner.config, session.as_ref(), entry) {
            Err(frame) => {
                counter!(INGRESS_ERRORS_TOTAL, "reason" => "validation").increment(1);
                let _ = conn.send_frame(&frame);
            }
            Ok(mut request) => {
                request.set_session_id(conn.id);
                counter!(
                    INGRESS_REQUESTS_TOTAL,
                    "platform" => request.platform.clone(),
                    "verb" => request.verb.clone()
                )
                .increment(1);
                let _ = conn.send_frame(&ConfirmFrame::new(request.rid.clone()));
                dispatch(inner, conn, session, request).await;
            }
        }
    }
}

/// The ingress validation chain.
///
/// Rules run in order and stop at the first failure; each failure maps to
/// exactly one error frame carrying the identity determined so far. A
/// surviving entry is normalized and schema-validated before dispatch.
pub fn validate_entry(
    registry: &ProtocolRegistry,
    config: &DispatcherConfig,
    session: &dyn Session,
    entry: Value,
) -> Result<VerbRequest, Box<ErrorFrame>> {
    let map = match entry {
        Value::Object(map) => map,
        // Non-object entries carry no identity at all.
        _ => {
            return Err(Box::new(ErrorFrame::validation(
                None,
                None,
                ERR_NO_RID.to_owned(),
            )))
        }
    };

    // 1. rid must be a string or number.
    let Some(rid) = map.get("rid").and_then(Rid::from_value) else {
        return Err(Box::new(ErrorFrame::validation(
            None,
            None,
            ERR_NO_RID.to_owned(),
        )));
    };

    // 2. platform must be a string.
    let Some(platform) = map.get("platform").and_then(Value::as_str).map(str::to_owned) else {
        return Err(Box::new(ErrorFrame::validation(
            Some(rid),
            None,
            ERR_NO_PLATFORM.to_owned(),
        )));
    };

    let fail = |rid: Rid, platform: String, message: String| {
        Err(Box::new(ErrorFrame::validation(
            Some(rid),
            Some(platform),
            message,
        )))
    };

    // 3. verb must be a string.
    let Some(verb) = map.get("verb").and_then(Value::as_str).map(str::to_owned) else {
        return fail(rid, platform, ERR_NO_VERB.to_owned());
    };

    // 4. platform must exist, and a remote platform must have answered at
    //    least one ping.
    let Some(record) = registry.platform(&platform) else {
        let message = errors::unknown_platform(&platform);
        return fail(rid, platform, message);
    };
    if !record.is_local() && !record.ping().is_some_and(|p| p.has_responded()) {
        let message = errors::unknown_platform(&platform);
        return fail(rid, platform, message);
    }

    // 5. platform must be in the loaded allow-list.
    if !config.is_loaded(&platform) {
        let message = errors::platform_not_loaded(&platform);
        return fail(rid, platform, message);
    }

    // 6. verb must be defined under the platform.
    let Some(spec) = record.verb(&verb) else {
        let message = errors::unknown_verb(&verb);
        return fail(rid, platform, message);
    };

    // 7. sessionId is reserved for the dispatcher.
    if map.contains_key("sessionId") {
        return fail(rid, platform, ERR_RESERVED_SESSION_ID.to_owned());
    }

    // 8. the session must be registered, except for the register verb.
    if !session.is_registered() && verb != REGISTER_VERB {
        return fail(rid, platform, ERR_NOT_REGISTERED.to_owned());
    }

    let request = VerbRequest::normalize(map, rid, platform, verb);
    if let Err(detail) = spec.validate(&request.as_value()) {
        return Err(Box::new(ErrorFrame::schema(
            &request,
            errors::schema_mismatch(&detail),
        )));
    }
    Ok(request)
}

/// Route a validated request: local handlers run in-process and their
/// reply is pushed to the session's outgoing channel; everything else is
/// serialized onto the platform listener channel.
async fn dispatch(
    inner: &Arc<DispatcherInner>,
    conn: &Arc<ClientConnection>,
    session: &Arc<dyn Session>,
    request: VerbRequest,
) {
    match inner.registry.route(&request.platform, &request.verb) {
        Some(VerbRoute::Local(handler)) => {
            let frame = match handler.handle(&request, session.as_ref()).await {
                Ok(data) => serde_json::to_string(&MessageFrame::reply(&request, data)),
                Err(HandlerError { message, object }) => {
                    serde_json::to_string(&ErrorFrame::handler(&request, message, object))
                }
            };
            let payload = match frame {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(%error, "failed to serialize handler reply");
                    return;
                }
            };
            let channel = outgoing_channel(&inner.sockethub_id, conn.id);
            if let Err(error) = inner.queue.push(&channel, payload).await {
                warn!(%error, channel, "failed to push handler reply");
            }
        }
        Some(VerbRoute::Queue) => {
            let payload = match request.to_json() {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(%error, "failed to serialize request for listener");
                    return;
                }
            };
            let channel = listener_channel(&inner.sockethub_id, &request.platform);
            // The client already holds a confirm; a failed push is logged
            // and the request is dropped.
            match inner.queue.push(&channel, payload).await {
                Ok(()) => {
                    counter!(QUEUE_PUSHES_TOTAL, "platform" => request.platform.clone())
                        .increment(1);
                }
                Err(error) => {
                    warn!(%error, channel, "failed to forward request to listener");
                }
            }
        }
        // Unreachable after rule 6, barring a registry swap.
        None => warn!(
            platform = request.platform,
            verb = request.verb,
            "no route for validated request"
        ),
    }
}

/// Connection close: broadcast cleanup, unblock the egress pump, and
/// destroy the session after the drain grace. Failures are logged and
/// swallowed.
async fn teardown(inner: &Arc<DispatcherInner>, conn: &Arc<ClientConnection>) {
    let sid = conn.id;
    info!(session_id = %sid, "client disconnected");
    counter!(DISCONNECTS_TOTAL).increment(1);

    let delivered = inner
        .store
        .subsystem()
        .send(SubsystemEvent::Cleanup { sids: vec![sid] });
    debug!(delivered, "cleanup broadcast");

    let channel = outgoing_channel(&inner.sockethub_id, sid);
    if let Err(error) = inner
        .queue
        .push(&channel, sockethub_proto::DISCONNECT_SENTINEL.to_owned())
        .await
    {
        warn!(%error, channel, "failed to push disconnect sentinel");
    }

    let task_inner = inner.clone();
    let destroy = tokio::spawn(async move {
        tokio::time::sleep(task_inner.config.destroy_grace()).await;
        match task_inner.store.destroy(sid).await {
            Ok(()) => debug!(session_id = %sid, "session destroyed"),
            Err(error) => warn!(session_id = %sid, %error, "session destroy failed"),
        }
    });
    inner.shutdown.register(TaskKind::Destroy, destroy);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sockethub_proto::PlatformDef;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubSession {
        registered: AtomicBool,
    }

    impl StubSession {
        fn registered() -> Self {
            Self {
                registered: AtomicBool::new(true),
            }
        }

        fn unregistered() -> Self {
            Self {
                registered: AtomicBool::new(false),
            }
        }
    }

    impl Session for StubSession {
        fn is_registered(&self) -> bool {
            self.registered.load(Ordering::Relaxed)
        }

        fn send(&self, _frame: &Value) -> bool {
            true
        }
    }

    struct RegisterHandler;

    #[async_trait::async_trait]
    impl sockethub_proto::VerbHandler for RegisterHandler {
        async fn handle(
            &self,
            _request: &VerbRequest,
            _session: &dyn Session,
        ) -> Result<Value, HandlerError> {
            Ok(json!({"registered": true}))
        }
    }

    fn make_registry() -> ProtocolRegistry {
        ProtocolRegistry::builder()
            .platform(PlatformDef::remote("xmpp").verb("send", json!({})))
            .platform(PlatformDef::local("dispatcher").handled_verb(
                "register",
                json!({}),
                RegisterHandler,
            ))
            .build()
            .unwrap()
    }

    fn make_config() -> DispatcherConfig {
        DispatcherConfig {
            platforms: vec!["xmpp".into()],
            ..DispatcherConfig::default()
        }
    }

    fn mark_live(registry: &ProtocolRegistry, platform: &str) {
        assert!(registry.mark_received(platform, 1_000));
    }

    fn expect_error(
        registry: &ProtocolRegistry,
        config: &DispatcherConfig,
        session: &dyn Session,
        entry: Value,
    ) -> ErrorFrame {
        match validate_entry(registry, config, session, entry) {
            Err(frame) => *frame,
            Ok(request) => panic!("expected error, got request for {}", request.verb),
        }
    }

    // ── Chain rules in order ────────────────────────────────────────

    #[test]
    fn rule1_missing_rid() {
        let registry = make_registry();
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"platform": "xmpp", "verb": "send"}),
        );
        assert_eq!(frame.message, ERR_NO_RID);
        assert!(frame.rid.is_none());
        assert!(frame.platform.is_none());
    }

    #[test]
    fn rule1_rid_wrong_type() {
        let registry = make_registry();
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"rid": true, "platform": "xmpp", "verb": "send"}),
        );
        assert_eq!(frame.message, ERR_NO_RID);
    }

    #[test]
    fn rule2_missing_platform() {
        let registry = make_registry();
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"rid": "1", "verb": "send"}),
        );
        assert_eq!(frame.message, ERR_NO_PLATFORM);
        assert_eq!(frame.rid, Some(Rid::from("1")));
    }

    #[test]
    fn rule3_missing_verb() {
        let registry = make_registry();
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"rid": "b", "platform": "xmpp"}),
        );
        assert_eq!(frame.message, ERR_NO_VERB);
        assert_eq!(frame.platform.as_deref(), Some("xmpp"));
    }

    #[test]
    fn rule4_unknown_platform() {
        let registry = make_registry();
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"rid": "1", "platform": "irc", "verb": "send"}),
        );
        assert_eq!(frame.message, "unknown platform received: irc");
    }

    #[test]
    fn rule4_remote_platform_never_responded() {
        let registry = make_registry();
        // xmpp exists but has never answered a ping.
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"rid": "1", "platform": "xmpp", "verb": "send"}),
        );
        assert_eq!(frame.message, "unknown platform received: xmpp");
    }

    #[test]
    fn rule4_local_platform_skips_ping_check() {
        let registry = make_registry();
        let result = validate_entry(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"rid": "1", "platform": "dispatcher", "verb": "register"}),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn rule5_platform_not_loaded() {
        let registry = ProtocolRegistry::builder()
            .platform(PlatformDef::remote("xmpp").verb("send", json!({})))
            .platform(PlatformDef::remote("irc").verb("send", json!({})))
            .build()
            .unwrap();
        mark_live(&registry, "irc");
        // Allow-list only contains xmpp.
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"rid": "1", "platform": "irc", "verb": "send"}),
        );
        assert_eq!(frame.message, "platform 'irc' not loaded");
    }

    #[test]
    fn rule6_unknown_verb() {
        let registry = make_registry();
        mark_live(&registry, "xmpp");
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"rid": "1", "platform": "xmpp", "verb": "fly"}),
        );
        assert_eq!(frame.message, "unknown verb received: fly");
    }

    #[test]
    fn rule7_reserved_session_id() {
        let registry = make_registry();
        mark_live(&registry, "xmpp");
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"rid": "1", "platform": "xmpp", "verb": "send", "sessionId": "123"}),
        );
        assert_eq!(frame.message, ERR_RESERVED_SESSION_ID);
    }

    #[test]
    fn rule8_unregistered_session() {
        let registry = make_registry();
        mark_live(&registry, "xmpp");
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::unregistered(),
            json!({"rid": 2, "platform": "xmpp", "verb": "send", "object": {}}),
        );
        assert_eq!(frame.message, ERR_NOT_REGISTERED);
        assert_eq!(frame.rid, Some(Rid::from(2u64)));
    }

    #[test]
    fn rule8_register_verb_exempt() {
        let registry = make_registry();
        let result = validate_entry(
            &registry,
            &make_config(),
            &StubSession::unregistered(),
            json!({"rid": "a", "platform": "dispatcher", "verb": "register", "object": {}}),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn chain_short_circuits_on_first_failure() {
        let registry = make_registry();
        // Fails rule 1; the bogus platform must not surface.
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"platform": "bogus", "verb": "nope", "sessionId": "x"}),
        );
        assert_eq!(frame.message, ERR_NO_RID);
    }

    #[test]
    fn non_object_entry_fails_rule1() {
        let registry = make_registry();
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!([1, 2, 3]),
        );
        assert_eq!(frame.message, ERR_NO_RID);
    }

    // ── Schema step ─────────────────────────────────────────────────

    #[test]
    fn schema_failure_echoes_request_identity() {
        let registry = ProtocolRegistry::builder()
            .platform(PlatformDef::remote("xmpp").verb(
                "send",
                json!({
                    "type": "object",
                    "properties": {"object": {"type": "object", "required": ["text"]}},
                }),
            ))
            .build()
            .unwrap();
        mark_live(&registry, "xmpp");
        let frame = expect_error(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({
                "rid": "s1", "platform": "xmpp", "verb": "send",
                "object": {}, "target": {"id": "x"},
            }),
        );
        assert!(frame
            .message
            .starts_with("unable to validate json against schema: "));
        assert_eq!(frame.verb, "send");
        assert_eq!(frame.target, vec![json!({"id": "x"})]);
    }

    #[test]
    fn valid_entry_normalized() {
        let registry = make_registry();
        mark_live(&registry, "xmpp");
        let request = validate_entry(
            &registry,
            &make_config(),
            &StubSession::registered(),
            json!({"rid": "1", "platform": "xmpp", "verb": "send", "target": {"id": "x"}}),
        )
        .unwrap();
        assert_eq!(request.target().len(), 1);
        assert_eq!(request.object(), &json!({}));
        assert!(request.session_id().is_none());
    }
}
