//! Handler registry with declarative parameter schemas.
//!
//! Handlers register under an event name with a [`HandlerSpec`]: parameter
//! specs (name, type, required, allowed values, description), the events
//! they are known to emit, and an optional required capability. The
//! router validates input against the specs before the handler body runs
//! and discovery reads the same specs back out — no reflection anywhere.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use ksi_core::{Capability, Event, EventName, KsiError, KsiResult};
use serde::{Deserialize, Serialize};

use crate::router::RouterHandle;

// ---------------------------------------------------------------------------
// Parameter schema
// ---------------------------------------------------------------------------

/// JSON type a parameter must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// JSON string.
    String,
    /// JSON integer.
    Integer,
    /// Any JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
}

impl ParamType {
    fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// Declared schema for one event parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name within the event data object.
    pub name: String,
    /// Required JSON type.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Whether the parameter must be present.
    pub required: bool,
    /// Closed set of allowed values, when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<serde_json::Value>>,
    /// Human-facing description for discovery.
    pub description: String,
}

impl ParamSpec {
    /// A required parameter.
    #[must_use]
    pub fn required(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_owned(),
            param_type,
            required: true,
            allowed: None,
            description: description.to_owned(),
        }
    }

    /// An optional parameter.
    #[must_use]
    pub fn optional(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_owned(),
            param_type,
            required: false,
            allowed: None,
            description: description.to_owned(),
        }
    }

    /// Restrict to a closed value set.
    #[must_use]
    pub fn with_allowed(mut self, allowed: Vec<serde_json::Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }
}

// ---------------------------------------------------------------------------
// Handler spec + trait
// ---------------------------------------------------------------------------

/// Everything declared at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerSpec {
    /// Event name handled.
    pub event: String,
    /// One-line summary for discovery.
    pub summary: String,
    /// Declared parameters.
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Events this handler is known to emit.
    #[serde(default)]
    pub emits: Vec<String>,
    /// Capability an agent must hold for this event to dispatch on its
    /// behalf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_capability: Option<Capability>,
}

impl HandlerSpec {
    /// Spec with no parameters.
    #[must_use]
    pub fn new(event: &str, summary: &str) -> Self {
        Self {
            event: event.to_owned(),
            summary: summary.to_owned(),
            params: Vec::new(),
            emits: Vec::new(),
            required_capability: None,
        }
    }

    /// Add a parameter.
    #[must_use]
    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Declare an emitted event.
    #[must_use]
    pub fn emits(mut self, event: &str) -> Self {
        self.emits.push(event.to_owned());
        self
    }

    /// Require a capability for agent-originated dispatch.
    #[must_use]
    pub fn requires(mut self, capability: Capability) -> Self {
        self.required_capability = Some(capability);
        self
    }

    /// Validate `data` against the declared parameters.
    ///
    /// # Errors
    ///
    /// Returns `invalid_argument` naming the first violation; the handler
    /// body is never invoked on failure.
    pub fn validate(&self, data: &serde_json::Value) -> KsiResult<()> {
        let Some(object) = data.as_object() else {
            return Err(KsiError::invalid_argument(format!(
                "{}: event data must be an object",
                self.event
            )));
        };
        for param in &self.params {
            match object.get(&param.name) {
                None | Some(serde_json::Value::Null) => {
                    if param.required {
                        return Err(KsiError::invalid_argument(format!(
                            "{}: missing required parameter {:?}",
                            self.event, param.name
                        )));
                    }
                },
                Some(value) => {
                    if !param.param_type.accepts(value) {
                        return Err(KsiError::invalid_argument(format!(
                            "{}: parameter {:?} has wrong type",
                            self.event, param.name
                        )));
                    }
                    if let Some(allowed) = &param.allowed {
                        if !allowed.contains(value) {
                            return Err(KsiError::invalid_argument(format!(
                                "{}: parameter {:?} not in allowed set",
                                self.event, param.name
                            )));
                        }
                    }
                },
            }
        }
        Ok(())
    }
}

/// What a handler body gets to work with.
///
/// Cloneable; `emit` enqueues a child event dispatched after the current
/// handler returns, `call` dispatches a child event and awaits its
/// replies.
#[derive(Clone)]
pub struct HandlerApi {
    /// Handle back into the dispatch loop.
    pub router: RouterHandle,
    /// Context of the event being handled.
    pub context: ksi_core::EventContext,
}

impl HandlerApi {
    /// Emit a follow-up event (fire and forget).
    pub fn emit(&self, name: EventName, data: serde_json::Value) {
        self.router.emit_from(name, data, &self.context);
    }

    /// Dispatch a follow-up event and await its handler replies.
    ///
    /// # Errors
    ///
    /// Returns the dispatched event's error, if any.
    pub async fn call(
        &self,
        name: EventName,
        data: serde_json::Value,
    ) -> KsiResult<Vec<serde_json::Value>> {
        self.router.call_from(name, data, &self.context).await
    }
}

/// A registered event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. The returned JSON object is the caller's reply
    /// frame (or one element of it when several handlers match).
    async fn handle(&self, event: Event, api: HandlerApi) -> KsiResult<serde_json::Value>;
}

/// Adapter so closures can register without a named type.
pub(crate) struct FnHandler<F>(pub(crate) F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event, HandlerApi) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = KsiResult<serde_json::Value>> + Send,
{
    async fn handle(&self, event: Event, api: HandlerApi) -> KsiResult<serde_json::Value> {
        (self.0)(event, api).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// One registration: spec + boxed handler.
pub(crate) struct Registered {
    pub(crate) spec: HandlerSpec,
    pub(crate) handler: Arc<dyn EventHandler>,
}

/// Name → ordered handlers, plus a revision counter for discovery caches.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Vec<Arc<Registered>>>,
    revision: AtomicU64,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("events", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its spec's event name.
    ///
    /// # Panics
    ///
    /// Panics if the spec's event name is malformed; registration happens
    /// at startup with literal names, so this is a programming error.
    pub fn register(&self, spec: HandlerSpec, handler: Arc<dyn EventHandler>) {
        EventName::parse(&spec.event).expect("handler registered under malformed event name");
        let entry = Arc::new(Registered { spec, handler });
        self.handlers
            .entry(entry.spec.event.clone())
            .or_default()
            .push(entry);
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    /// Register a closure handler.
    ///
    /// # Panics
    ///
    /// As [`HandlerRegistry::register`].
    pub fn register_fn<F, Fut>(&self, spec: HandlerSpec, handler: F)
    where
        F: Fn(Event, HandlerApi) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = KsiResult<serde_json::Value>> + Send + 'static,
    {
        self.register(spec, Arc::new(FnHandler(handler)));
    }

    /// Handlers registered for `name`, in registration order.
    pub(crate) fn matching(&self, name: &EventName) -> Vec<Arc<Registered>> {
        self.handlers
            .get(name.as_str())
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    /// All specs, name-sorted (discovery).
    #[must_use]
    pub fn specs(&self) -> Vec<HandlerSpec> {
        let mut specs: Vec<HandlerSpec> = self
            .handlers
            .iter()
            .flat_map(|entry| entry.value().iter().map(|r| r.spec.clone()).collect::<Vec<_>>())
            .collect();
        specs.sort_by(|a, b| a.event.cmp(&b.event));
        specs
    }

    /// Monotonic revision; bumps on every registration.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validation_rules() {
        let spec = HandlerSpec::new("agent:spawn", "Spawn an agent")
            .param(ParamSpec::required("component", ParamType::String, "profile name"))
            .param(
                ParamSpec::optional("mode", ParamType::String, "spawn mode")
                    .with_allowed(vec![json!("fresh"), json!("resume")]),
            );

        assert!(spec.validate(&json!({"component": "x"})).is_ok());
        assert!(spec.validate(&json!({"component": "x", "mode": "fresh"})).is_ok());
        // Missing required.
        assert!(spec.validate(&json!({})).is_err());
        // Wrong type.
        assert!(spec.validate(&json!({"component": 3})).is_err());
        // Outside allowed set.
        assert!(spec.validate(&json!({"component": "x", "mode": "weird"})).is_err());
        // Non-object data.
        assert!(spec.validate(&json!("nope")).is_err());
        // Explicit null counts as absent.
        assert!(spec.validate(&json!({"component": "x", "mode": null})).is_ok());
    }

    #[test]
    fn test_registry_revision_bumps() {
        let registry = HandlerRegistry::new();
        let before = registry.revision();
        registry.register_fn(HandlerSpec::new("system:noop", "nothing"), |_, _| async {
            Ok(json!({}))
        });
        assert!(registry.revision() > before);
        assert_eq!(registry.specs().len(), 1);
    }
}
