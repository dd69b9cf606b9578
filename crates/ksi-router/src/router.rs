//! The dispatch loop and its public handle.
//!
//! One owner task serializes everything that must be ordered: context
//! assignment, capability gating, the log append that defines global
//! event order, transformer synthesis, subscription fan-out and
//! orchestration bubble-up. Handler bodies then run on spawned tasks, so
//! a slow handler never stalls routing and handlers are free to submit
//! follow-up events and await their replies.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use ksi_core::{
    Event, EventContext, EventName, EventOrigin, KsiError, KsiResult,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::capabilities::CapabilityIndex;
use crate::log::{EventLog, LogOutcome};
use crate::orch_index::OrchestrationIndex;
use crate::registry::{HandlerApi, HandlerRegistry, Registered};
use crate::subscription::{PushOutcome, SubscriptionRegistry, SubscriptionScope};
use crate::transformer::TransformerRegistry;

/// Name of the event the router emits for handler failures.
pub(crate) const EVENT_ERROR: &str = "system:error";

/// Name of the event announcing dropped frames for a lagging subscriber.
pub(crate) const EVENT_LAG: &str = "monitor:lag";

/// Correlation chains deeper than this stop triggering transformers — a
/// cycle guard for self-referential rule sets.
const MAX_TRANSFORM_DEPTH: u32 = 64;

/// Consecutive `internal` handler errors before graceful shutdown.
const INTERNAL_ERROR_LIMIT: u32 = 10;

enum RouterMsg {
    Dispatch {
        name: EventName,
        data: serde_json::Value,
        origin: EventOrigin,
        parent: Option<EventContext>,
        reply: Option<oneshot::Sender<KsiResult<Vec<serde_json::Value>>>>,
    },
    Shutdown,
}

// ---------------------------------------------------------------------------
// RouterHandle
// ---------------------------------------------------------------------------

/// Cloneable handle for submitting events into the dispatch loop.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<RouterMsg>,
}

impl std::fmt::Debug for RouterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterHandle").finish_non_exhaustive()
    }
}

impl RouterHandle {
    /// Dispatch a fresh event and await its handler replies.
    ///
    /// # Errors
    ///
    /// Returns the dispatched event's error, or `internal` if the router
    /// is shut down.
    pub async fn submit(
        &self,
        name: EventName,
        data: serde_json::Value,
        origin: EventOrigin,
    ) -> KsiResult<Vec<serde_json::Value>> {
        self.dispatch(name, data, origin, None).await
    }

    /// Dispatch a child event of `parent` and await its handler replies.
    ///
    /// # Errors
    ///
    /// As [`RouterHandle::submit`].
    pub async fn call_from(
        &self,
        name: EventName,
        data: serde_json::Value,
        parent: &EventContext,
    ) -> KsiResult<Vec<serde_json::Value>> {
        self.dispatch(name, data, EventOrigin::System, Some(parent.clone()))
            .await
    }

    /// Fire-and-forget a fresh event.
    pub fn emit(&self, name: EventName, data: serde_json::Value, origin: EventOrigin) {
        let _ = self.tx.send(RouterMsg::Dispatch {
            name,
            data,
            origin,
            parent: None,
            reply: None,
        });
    }

    /// Fire-and-forget a child event of `parent`.
    pub fn emit_from(&self, name: EventName, data: serde_json::Value, parent: &EventContext) {
        let _ = self.tx.send(RouterMsg::Dispatch {
            name,
            data,
            origin: EventOrigin::System,
            parent: Some(parent.clone()),
            reply: None,
        });
    }

    /// Ask the dispatch loop to drain and stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(RouterMsg::Shutdown);
    }

    async fn dispatch(
        &self,
        name: EventName,
        data: serde_json::Value,
        origin: EventOrigin,
        parent: Option<EventContext>,
    ) -> KsiResult<Vec<serde_json::Value>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RouterMsg::Dispatch {
                name,
                data,
                origin,
                parent,
                reply: Some(reply_tx),
            })
            .map_err(|_| KsiError::internal("router is shut down"))?;
        reply_rx
            .await
            .map_err(|_| KsiError::internal("router dropped the reply"))?
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// The dispatch-loop owner.
pub struct Router {
    registry: Arc<HandlerRegistry>,
    log: Arc<EventLog>,
    transformers: Arc<TransformerRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    orchestrations: Arc<OrchestrationIndex>,
    capabilities: Arc<CapabilityIndex>,
    fatal: CancellationToken,
    internal_errors: Arc<AtomicU32>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl Router {
    /// Assemble a router over its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<HandlerRegistry>,
        log: Arc<EventLog>,
        transformers: Arc<TransformerRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
        orchestrations: Arc<OrchestrationIndex>,
        capabilities: Arc<CapabilityIndex>,
    ) -> Self {
        Self {
            registry,
            log,
            transformers,
            subscriptions,
            orchestrations,
            capabilities,
            fatal: CancellationToken::new(),
            internal_errors: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Token that fires when the router hits a fatal condition (log write
    /// failure, repeated internal errors). The daemon watches it to write
    /// the shutdown marker and exit.
    #[must_use]
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Spawn the dispatch loop; returns the submission handle and the
    /// loop's join handle.
    #[must_use]
    pub fn start(self) -> (RouterHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RouterHandle { tx };
        let loop_handle = handle.clone();
        let join = tokio::spawn(async move {
            self.run(rx, loop_handle).await;
        });
        (handle, join)
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<RouterMsg>, handle: RouterHandle) {
        debug!("dispatch loop started");
        while let Some(msg) = rx.recv().await {
            match msg {
                RouterMsg::Shutdown => {
                    debug!("dispatch loop shutting down");
                    break;
                },
                RouterMsg::Dispatch {
                    name,
                    data,
                    origin,
                    parent,
                    reply,
                } => {
                    if self.dispatch_one(name, data, origin, parent, reply, &handle) == Flow::Fatal
                    {
                        self.fatal.cancel();
                        break;
                    }
                },
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch_one(
        &self,
        name: EventName,
        data: serde_json::Value,
        origin: EventOrigin,
        parent: Option<EventContext>,
        reply: Option<oneshot::Sender<KsiResult<Vec<serde_json::Value>>>>,
        handle: &RouterHandle,
    ) -> Flow {
        // 1. Context: fresh id, inherited correlation/orchestration chain.
        let mut ctx = match &parent {
            Some(parent) => EventContext::child_of(parent),
            None => EventContext::root(),
        };
        match &origin {
            EventOrigin::Client(client_id) => {
                ctx.client_id.get_or_insert_with(|| client_id.clone());
            },
            EventOrigin::Agent(agent_id) => {
                ctx.agent_id = Some(agent_id.clone());
                if ctx.orchestration_id.is_none() {
                    if let Some(orch) = self.orchestrations.orchestration_of(agent_id) {
                        let (depth, root) = self.orchestrations.chain_position(&orch);
                        ctx = ctx.with_orchestration(orch, depth, root);
                    }
                }
            },
            EventOrigin::System => {},
        }
        let event = Event::new(name, data, ctx);

        // 2. Capability gate for agent-attributed events. The check keys
        // off context, so transformer-derived events stay gated too.
        let handlers = self.registry.matching(&event.name);
        if let Some(agent_id) = &event.context.agent_id {
            for registered in &handlers {
                if let Some(capability) = &registered.spec.required_capability {
                    if !self.capabilities.holds(agent_id, capability) {
                        let err = KsiError::permission_denied(format!(
                            "agent {agent_id} lacks {capability} required by {}",
                            event.name
                        ));
                        warn!(agent = %agent_id, event = %event.name, %capability, "capability denied");
                        match self.log.append_dispatch(&event) {
                            Ok(seq) => {
                                let _ = self.log.append_outcome(
                                    seq,
                                    event.context.event_id.clone(),
                                    vec![LogOutcome {
                                        ok: false,
                                        error: Some(err.to_string()),
                                    }],
                                    0,
                                );
                            },
                            Err(e) => {
                                error!(error = %e, "event log write failed");
                                respond(reply, Err(KsiError::io("event log unavailable")));
                                return Flow::Fatal;
                            },
                        }
                        emit_error_event(handle, &event, &err);
                        respond(reply, Err(err));
                        return Flow::Continue;
                    }
                }
            }
        }

        // 3. Log append defines global order; failure is fatal.
        let seq = match self.log.append_dispatch(&event) {
            Ok(seq) => seq,
            Err(e) => {
                error!(error = %e, "event log write failed");
                respond(reply, Err(KsiError::io("event log unavailable")));
                return Flow::Fatal;
            },
        };

        // 4. Transformers synthesize follow-up events (depth-guarded).
        let mut synthesized = 0;
        if event.context.depth < MAX_TRANSFORM_DEPTH {
            for syn in self.transformers.snapshot().apply(&event) {
                synthesized += 1;
                if syn.is_async {
                    let (tx, rx) = oneshot::channel();
                    let _ = handle.tx.send(RouterMsg::Dispatch {
                        name: syn.target.clone(),
                        data: syn.data,
                        origin: EventOrigin::System,
                        parent: Some(event.context.clone()),
                        reply: Some(tx),
                    });
                    let correlate = handle.clone();
                    let parent_ctx = event.context.clone();
                    let target = syn.target;
                    tokio::spawn(async move {
                        let outcome = rx.await;
                        let data = match outcome {
                            Ok(Ok(results)) => serde_json::json!({
                                "target": target.as_str(),
                                "source_event_id": parent_ctx.event_id,
                                "result": results,
                            }),
                            Ok(Err(err)) => serde_json::json!({
                                "target": target.as_str(),
                                "source_event_id": parent_ctx.event_id,
                                "error": { "kind": err.kind, "message": err.message },
                            }),
                            Err(_) => return,
                        };
                        if let Ok(name) = EventName::parse("transformer:result") {
                            correlate.emit_from(name, data, &parent_ctx);
                        }
                    });
                } else {
                    let _ = handle.tx.send(RouterMsg::Dispatch {
                        name: syn.target,
                        data: syn.data,
                        origin: EventOrigin::System,
                        parent: Some(event.context.clone()),
                        reply: None,
                    });
                }
            }
        } else if !self.transformers.snapshot().is_empty() {
            warn!(event = %event.name, depth = event.context.depth, "transformer depth cap hit");
        }

        // 5. Subscription fan-out, never blocking: overruns evict and are
        // announced with a lag event.
        let shared = Arc::new(event.clone());
        for subscription in self.subscriptions.all() {
            if !subscription.matches(&shared) || !self.scope_matches(&subscription.scope, &shared) {
                continue;
            }
            match subscription.queue.push(Arc::clone(&shared)) {
                PushOutcome::Queued => {},
                PushOutcome::Dropped(count) => {
                    if shared.name.as_str() != EVENT_LAG {
                        if let Ok(lag) = EventName::parse(EVENT_LAG) {
                            handle.emit(
                                lag,
                                serde_json::json!({
                                    "subscriber_id": subscription.id,
                                    "dropped": count,
                                }),
                                EventOrigin::System,
                            );
                        }
                    }
                },
                PushOutcome::Closed => {
                    self.subscriptions.remove(&subscription.id);
                },
            }
        }

        // 6. Bubble-up to ancestor orchestrations within their levels.
        self.bubble_up(&shared);

        // 7. Handlers run off-loop; the reply goes out when they finish.
        if handlers.is_empty() {
            // Events with no handler still flow to subscribers and
            // transformers; only a caller expecting a reply gets an error.
            if let Some(reply) = reply {
                if synthesized > 0 {
                    let _ = reply.send(Ok(Vec::new()));
                } else {
                    let _ = reply.send(Err(KsiError::not_found(format!(
                        "no handler for {}",
                        shared.name
                    ))));
                }
            }
            return Flow::Continue;
        }

        self.spawn_handlers(event, handlers, seq, reply, handle);
        Flow::Continue
    }

    fn spawn_handlers(
        &self,
        event: Event,
        handlers: Vec<Arc<Registered>>,
        seq: u64,
        reply: Option<oneshot::Sender<KsiResult<Vec<serde_json::Value>>>>,
        handle: &RouterHandle,
    ) {
        let log = Arc::clone(&self.log);
        let handle = handle.clone();
        let internal_errors = Arc::clone(&self.internal_errors);
        let fatal = self.fatal.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let api = HandlerApi {
                router: handle.clone(),
                context: event.context.clone(),
            };
            let mut outcomes = Vec::with_capacity(handlers.len());
            let mut results = Vec::new();
            let mut first_error: Option<KsiError> = None;
            for registered in handlers {
                let outcome = match registered.spec.validate(&event.data) {
                    Err(e) => Err(e),
                    Ok(()) => registered.handler.handle(event.clone(), api.clone()).await,
                };
                match outcome {
                    Ok(value) => {
                        outcomes.push(LogOutcome {
                            ok: true,
                            error: None,
                        });
                        results.push(value);
                    },
                    Err(err) => {
                        outcomes.push(LogOutcome {
                            ok: false,
                            error: Some(err.to_string()),
                        });
                        if err.kind == ksi_core::ErrorKind::Internal {
                            let seen = internal_errors.fetch_add(1, Ordering::SeqCst) + 1;
                            if seen >= INTERNAL_ERROR_LIMIT {
                                error!(count = seen, "repeated internal errors; shutting down");
                                fatal.cancel();
                            }
                        } else {
                            internal_errors.store(0, Ordering::SeqCst);
                        }
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    },
                }
            }
            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = started.elapsed().as_millis() as u64;
            if let Err(e) =
                log.append_outcome(seq, event.context.event_id.clone(), outcomes, duration_ms)
            {
                error!(error = %e, "event log outcome write failed");
                fatal.cancel();
            }
            match first_error {
                Some(err) => {
                    emit_error_event(&handle, &event, &err);
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(err));
                    }
                },
                None => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(results));
                    }
                },
            }
        });
    }

    /// Whether an event falls inside a subscription's scope.
    fn scope_matches(&self, scope: &SubscriptionScope, event: &Event) -> bool {
        match scope {
            SubscriptionScope::Global => true,
            SubscriptionScope::Agent(agent_id) => {
                event.context.agent_id.as_ref() == Some(agent_id)
            },
            SubscriptionScope::Subtree {
                orchestration_id,
                max_depth,
            } => match &event.context.orchestration_id {
                None => false,
                Some(event_orch) => self
                    .orchestrations
                    .ancestors(event_orch)
                    .into_iter()
                    .find(|(id, _)| id == orchestration_id)
                    .is_some_and(|(_, steps)| {
                        let relative = steps + u32::from(event.context.agent_id.is_some());
                        level_covers(*max_depth, relative)
                    }),
            },
        }
    }

    /// Deliver the event to every ancestor orchestration whose configured
    /// level covers it. An agent's event is one level below its own
    /// orchestration; the orchestration's own events are at level zero.
    fn bubble_up(&self, event: &Arc<Event>) {
        let Some(event_orch) = &event.context.orchestration_id else {
            return;
        };
        let is_error = event.name.as_str() == EVENT_ERROR;
        for (ancestor_id, steps) in self.orchestrations.ancestors(event_orch) {
            let Some(node) = self.orchestrations.get(&ancestor_id) else {
                continue;
            };
            let relative = steps + u32::from(event.context.agent_id.is_some());
            let level = if is_error {
                node.error_level
            } else {
                node.event_level
            };
            if level_covers(level, relative) {
                node.queue.push(Arc::clone(event));
            }
        }
    }
}

/// Whether a configured subscription level covers a relative depth
/// (`-1` = everything).
fn level_covers(level: i32, relative_depth: u32) -> bool {
    level < 0 || relative_depth <= level.unsigned_abs()
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Fatal,
}

fn respond(
    reply: Option<oneshot::Sender<KsiResult<Vec<serde_json::Value>>>>,
    outcome: KsiResult<Vec<serde_json::Value>>,
) {
    if let Some(reply) = reply {
        let _ = reply.send(outcome);
    }
}

/// Emit a `system:error` event correlated to the failing event.
fn emit_error_event(handle: &RouterHandle, source: &Event, err: &KsiError) {
    let Ok(name) = EventName::parse(EVENT_ERROR) else {
        return;
    };
    handle.emit_from(
        name,
        serde_json::json!({
            "kind": err.kind,
            "message": err.message,
            "retryable": err.retryable,
            "source_event": source.name.as_str(),
            "source_event_id": source.context.event_id,
        }),
        &source.context,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandlerSpec, ParamSpec, ParamType};
    use crate::subscription::{DeliveryQueue, Subscription};
    use ksi_core::{AgentId, Capability, SubscriberId};
    use ksi_store::Store;
    use serde_json::json;

    struct Fixture {
        registry: Arc<HandlerRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
        orchestrations: Arc<OrchestrationIndex>,
        capabilities: Arc<CapabilityIndex>,
        transformers: Arc<TransformerRegistry>,
        handle: RouterHandle,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().unwrap());
        let log = Arc::new(EventLog::open(dir.path(), store).unwrap());
        let registry = Arc::new(HandlerRegistry::new());
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let orchestrations = Arc::new(OrchestrationIndex::new());
        let capabilities = Arc::new(CapabilityIndex::new());
        let transformers = Arc::new(TransformerRegistry::new());
        let router = Router::new(
            Arc::clone(&registry),
            log,
            Arc::clone(&transformers),
            Arc::clone(&subscriptions),
            Arc::clone(&orchestrations),
            Arc::clone(&capabilities),
        );
        let (handle, _join) = router.start();
        Fixture {
            registry,
            subscriptions,
            orchestrations,
            capabilities,
            transformers,
            handle,
            _dir: dir,
        }
    }

    fn name(s: &str) -> EventName {
        EventName::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_reply_single_handler() {
        let fx = fixture();
        fx.registry.register_fn(
            HandlerSpec::new("test:echo", "echo")
                .param(ParamSpec::required("value", ParamType::String, "echoed")),
            |event, _api| async move { Ok(json!({"echoed": event.data["value"]})) },
        );
        let results = fx
            .handle
            .submit(name("test:echo"), json!({"value": "hi"}), EventOrigin::System)
            .await
            .unwrap();
        assert_eq!(results, vec![json!({"echoed": "hi"})]);
    }

    #[tokio::test]
    async fn test_invalid_argument_without_invoking_handler() {
        let fx = fixture();
        fx.registry.register_fn(
            HandlerSpec::new("test:echo", "echo")
                .param(ParamSpec::required("value", ParamType::String, "echoed")),
            |_event, _api| async move { panic!("handler body must not run") },
        );
        let err = fx
            .handle
            .submit(name("test:echo"), json!({}), EventOrigin::System)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ksi_core::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_unknown_event_is_not_found() {
        let fx = fixture();
        let err = fx
            .handle
            .submit(name("no:handler"), json!({}), EventOrigin::System)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ksi_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_capability_gate_denies_agent() {
        let fx = fixture();
        fx.registry.register_fn(
            HandlerSpec::new("agent:spawn", "spawn").requires(Capability::spawn_agents()),
            |_event, _api| async move { Ok(json!({"spawned": true})) },
        );
        let agent = AgentId::from("a1");
        let err = fx
            .handle
            .submit(
                name("agent:spawn"),
                json!({}),
                EventOrigin::Agent(agent.clone()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ksi_core::ErrorKind::PermissionDenied);

        // Granting the capability opens the gate.
        fx.capabilities
            .bind(agent.clone(), [Capability::spawn_agents()].into_iter().collect());
        let results = fx
            .handle
            .submit(name("agent:spawn"), json!({}), EventOrigin::Agent(agent))
            .await
            .unwrap();
        assert_eq!(results[0]["spawned"], true);
    }

    #[tokio::test]
    async fn test_handler_emitted_child_keeps_causality() {
        let fx = fixture();
        let seen: Arc<std::sync::Mutex<Vec<Event>>> = Arc::default();
        let seen_clone = Arc::clone(&seen);
        fx.registry.register_fn(
            HandlerSpec::new("test:parent", "parent"),
            |_event, api| async move {
                api.emit(EventName::parse("test:child").unwrap(), json!({}));
                Ok(json!({}))
            },
        );
        fx.registry.register_fn(
            HandlerSpec::new("test:child", "child"),
            move |event, _api| {
                let seen = Arc::clone(&seen_clone);
                async move {
                    seen.lock().unwrap().push(event);
                    Ok(json!({}))
                }
            },
        );
        fx.handle
            .submit(name("test:parent"), json!({}), EventOrigin::System)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let child = &seen[0];
        assert_eq!(child.context.depth, 1);
        assert!(child.context.parent_event_id.is_some());
    }

    #[tokio::test]
    async fn test_subscription_fan_out_and_transformer() {
        let fx = fixture();
        let queue = DeliveryQueue::new(16);
        fx.subscriptions.add(
            Subscription::new(
                SubscriberId::from("s1"),
                None,
                vec!["monitor:*".to_owned()],
                SubscriptionScope::Global,
                None,
                Arc::clone(&queue),
            )
            .unwrap(),
        );
        fx.transformers.swap(
            crate::transformer::TransformerSet::from_yaml(
                r#"
- source: "agent:status"
  target: "monitor:agent_status"
  mapping:
    agent: "{{data.agent_id}}"
"#,
            )
            .unwrap(),
        );

        fx.handle
            .emit(name("agent:status"), json!({"agent_id": "a1"}), EventOrigin::System);

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(2), queue.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.name.as_str(), "monitor:agent_status");
        assert_eq!(delivered.data["agent"], "a1");
        // The synthesized event is a child of the source event.
        assert_eq!(delivered.context.depth, 1);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_event() {
        let fx = fixture();
        fx.registry.register_fn(HandlerSpec::new("test:fail", "fails"), |_e, _a| async {
            Err(KsiError::conflict("nope"))
        });
        let queue = DeliveryQueue::new(16);
        fx.subscriptions.add(
            Subscription::new(
                SubscriberId::from("errs"),
                None,
                vec!["system:error".to_owned()],
                SubscriptionScope::Global,
                None,
                Arc::clone(&queue),
            )
            .unwrap(),
        );
        let err = fx
            .handle
            .submit(name("test:fail"), json!({}), EventOrigin::System)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ksi_core::ErrorKind::Conflict);

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(2), queue.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.data["kind"], "conflict");
        assert_eq!(delivered.data["source_event"], "test:fail");
    }
}
