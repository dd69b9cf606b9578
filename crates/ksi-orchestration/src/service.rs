//! The orchestration service and its event surface.
//!
//! # Bubbled delivery
//!
//! The router posts subtree events onto each orchestration's delivery
//! queue (see the router's bubble-up pass). A forwarder task per
//! orchestration drains that queue and re-emits each event as
//! `orchestration:event { orchestration_id, name, data, source }` on a
//! fresh chain — a fresh chain, not a child, so the re-emission cannot
//! bubble into its own queue. The orchestrator observes these through a
//! normal subscription.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ksi_composition::ComponentLoader;
use ksi_core::{
    AgentId, Capability, Event, EventName, EventOrigin, KsiError, KsiResult, OrchestrationId,
};
use ksi_router::{
    DeliveryQueue, HandlerApi, HandlerRegistry, HandlerSpec, OrchNode, OrchestrationIndex,
    ParamSpec, ParamType, RouterHandle,
};
use ksi_store::{Direction, EntityRef, Store, UpdateMode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

const TYPE_ORCH: &str = "orchestration";
const TYPE_AGENT: &str = "agent";

fn orch_ref(id: &OrchestrationId) -> EntityRef {
    EntityRef::new(TYPE_ORCH, id.as_str())
}

/// Persisted shape of an orchestration entity's property bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrchRecord {
    pattern: String,
    state: String,
    event_subscription_level: i32,
    error_subscription_level: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<OrchestrationId>,
    /// Pattern agent name → spawned agent id.
    #[serde(default)]
    agents: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    termination_requested: bool,
    created_at: DateTime<Utc>,
}

struct Inner {
    store: Arc<Store>,
    loader: Arc<ComponentLoader>,
    orchestrations: Arc<OrchestrationIndex>,
    router: RouterHandle,
    bubble_capacity: usize,
}

/// The orchestration service handle.
#[derive(Clone)]
pub struct OrchestrationService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for OrchestrationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationService").finish_non_exhaustive()
    }
}

impl OrchestrationService {
    /// Assemble the service. `bubble_capacity` bounds each
    /// orchestration's bubbled-event queue.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        loader: Arc<ComponentLoader>,
        orchestrations: Arc<OrchestrationIndex>,
        router: RouterHandle,
        bubble_capacity: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                loader,
                orchestrations,
                router,
                bubble_capacity,
            }),
        }
    }

    /// Register the `orchestration:*` handlers.
    pub fn register_handlers(&self, registry: &Arc<HandlerRegistry>) {
        let start = Arc::clone(&self.inner);
        registry.register_fn(
            HandlerSpec::new("orchestration:start", "Start an orchestration from a pattern")
                .param(ParamSpec::required("pattern", ParamType::String, "pattern component name"))
                .param(ParamSpec::optional("variables", ParamType::Object, "pattern variable overrides"))
                .param(ParamSpec::optional("parent", ParamType::String, "parent orchestration id"))
                .emits("agent:spawn")
                .emits("orchestration:started")
                .requires(Capability::orchestrate()),
            move |event: Event, api| {
                let inner = Arc::clone(&start);
                async move { inner.start(&event, &api).await }
            },
        );

        let status = Arc::clone(&self.inner);
        registry.register_fn(
            HandlerSpec::new("orchestration:status", "One orchestration's tree state").param(
                ParamSpec::required("orchestration_id", ParamType::String, "orchestration to read"),
            ),
            move |event: Event, _api| {
                let inner = Arc::clone(&status);
                async move { inner.status(&event) }
            },
        );

        let terminate = Arc::clone(&self.inner);
        registry.register_fn(
            HandlerSpec::new("orchestration:terminate", "Terminate an orchestration subtree")
                .param(ParamSpec::required(
                    "orchestration_id",
                    ParamType::String,
                    "orchestration to terminate",
                ))
                .emits("agent:terminate")
                .emits("orchestration:terminated")
                .requires(Capability::orchestrate()),
            move |event: Event, api| {
                let inner = Arc::clone(&terminate);
                async move { inner.terminate(&event, &api).await }
            },
        );

        let request = Arc::clone(&self.inner);
        registry.register_fn(
            HandlerSpec::new(
                "orchestration:request_termination",
                "Politely ask an orchestration to stop",
            )
            .param(ParamSpec::required(
                "orchestration_id",
                ParamType::String,
                "orchestration to stop",
            ))
            .param(ParamSpec::optional("reason", ParamType::String, "why")),
            move |event: Event, api| {
                let inner = Arc::clone(&request);
                async move { inner.request_termination(&event, &api) }
            },
        );
    }

    /// Restart reconciliation: re-register live orchestrations in the
    /// routing index and rebind their member agents.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn recover(&self) -> KsiResult<usize> {
        let mut revived = 0;
        for id in self.inner.store.entity_ids_of_type(TYPE_ORCH).map_err(KsiError::from)? {
            let orch_id = OrchestrationId::from(id.as_str());
            let Some(record) = self.inner.read(&orch_id)? else {
                continue;
            };
            if record.state != "running" {
                continue;
            }
            self.inner.register_node(&orch_id, &record);
            for edge in self
                .inner
                .store
                .neighbors(&orch_ref(&orch_id), Some("owns"), Direction::Out, usize::MAX, None)
                .map_err(KsiError::from)?
                .edges
            {
                if edge.to.entity_type == TYPE_AGENT {
                    self.inner
                        .orchestrations
                        .bind_agent(AgentId::from(edge.to.id.as_str()), orch_id.clone());
                }
            }
            revived += 1;
        }
        info!(revived, "orchestration recovery finished");
        Ok(revived)
    }
}

impl Inner {
    fn read(&self, id: &OrchestrationId) -> KsiResult<Option<OrchRecord>> {
        Ok(self
            .store
            .get_entity(&orch_ref(id))
            .map_err(KsiError::from)?
            .map(|e| serde_json::from_value(serde_json::Value::Object(e.properties)))
            .transpose()?)
    }

    fn write(&self, id: &OrchestrationId, record: &OrchRecord) -> KsiResult<()> {
        let serde_json::Value::Object(props) = serde_json::to_value(record)? else {
            return Err(KsiError::internal("orchestration record must serialize to an object"));
        };
        self.store
            .update_entity(&orch_ref(id), props, UpdateMode::Replace)
            .map_err(KsiError::from)?;
        Ok(())
    }

    /// Register the routing node and spawn the bubbled-event forwarder.
    fn register_node(&self, id: &OrchestrationId, record: &OrchRecord) {
        let queue = DeliveryQueue::new(self.bubble_capacity);
        self.orchestrations.register(
            id.clone(),
            OrchNode {
                parent: record.parent.clone(),
                event_level: record.event_subscription_level,
                error_level: record.error_subscription_level,
                queue: Arc::clone(&queue),
            },
        );
        let router = self.router.clone();
        let orch_id = id.clone();
        tokio::spawn(async move {
            debug!(orchestration = %orch_id, "bubble forwarder started");
            while let Some(event) = queue.pop().await {
                let Ok(name) = EventName::parse("orchestration:event") else {
                    continue;
                };
                router.emit(
                    name,
                    json!({
                        "orchestration_id": orch_id,
                        "name": event.name.as_str(),
                        "data": event.data,
                        "source": {
                            "event_id": event.context.event_id,
                            "correlation_id": event.context.correlation_id,
                            "agent_id": event.context.agent_id,
                        },
                    }),
                    EventOrigin::System,
                );
            }
            debug!(orchestration = %orch_id, "bubble forwarder stopped");
        });
    }

    // -----------------------------------------------------------------------
    // orchestration:start
    // -----------------------------------------------------------------------

    async fn start(&self, event: &Event, api: &HandlerApi) -> KsiResult<serde_json::Value> {
        let data = &event.data;
        let pattern_name = data
            .get("pattern")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KsiError::invalid_argument("pattern required"))?;
        let variables = match data.get("variables") {
            None => std::collections::BTreeMap::new(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| KsiError::invalid_argument(format!("variables: {e}")))?,
        };
        let pattern = self
            .loader
            .resolve_with_vars(pattern_name, &variables)
            .map_err(KsiError::from)?
            .as_pattern()
            .map_err(KsiError::from)?;

        let parent = data
            .get("parent")
            .and_then(|v| v.as_str())
            .map(OrchestrationId::from);
        if let Some(parent) = &parent {
            if self.read(parent)?.is_none() {
                return Err(KsiError::not_found(format!("parent orchestration {parent}")));
            }
        }

        let orch_id = OrchestrationId::new();
        let record = OrchRecord {
            pattern: pattern_name.to_owned(),
            state: "running".to_owned(),
            event_subscription_level: pattern.event_subscription_level.0,
            error_subscription_level: pattern.error_subscription_level.0,
            parent: parent.clone(),
            agents: serde_json::Map::new(),
            termination_requested: false,
            created_at: Utc::now(),
        };
        let serde_json::Value::Object(props) = serde_json::to_value(&record)? else {
            return Err(KsiError::internal("orchestration record must serialize to an object"));
        };
        self.store
            .create_entity(&orch_ref(&orch_id), props)
            .map_err(KsiError::from)?;
        if let Some(parent) = &parent {
            let empty = serde_json::Map::new;
            self.store
                .create_relationship(&orch_ref(parent), "parent_of", &orch_ref(&orch_id), empty())
                .map_err(KsiError::from)?;
            self.store
                .create_relationship(&orch_ref(parent), "owns", &orch_ref(&orch_id), empty())
                .map_err(KsiError::from)?;
        }

        // Routing must exist before the first member agent emits.
        self.register_node(&orch_id, &record);

        // Spawn the pattern's agents through the normal event surface.
        let mut spawned = serde_json::Map::new();
        for agent in &pattern.agents {
            let mut spawn_data = json!({
                "component": agent.profile,
                "orchestration_id": orch_id,
            });
            if let Some(object) = spawn_data.as_object_mut() {
                if !agent.capabilities.is_empty() {
                    object.insert("capabilities".to_owned(), serde_json::to_value(&agent.capabilities)?);
                }
                if let Some(prompt) = &agent.initial_prompt {
                    object.insert("initial_prompt".to_owned(), json!(prompt));
                }
            }
            let results = api
                .call(
                    EventName::parse("agent:spawn").map_err(|e| KsiError::internal(e.to_string()))?,
                    spawn_data,
                )
                .await?;
            let agent_id = results
                .first()
                .and_then(|r| r.get("agent_id"))
                .and_then(|v| v.as_str())
                .ok_or_else(|| KsiError::internal("agent:spawn returned no agent_id"))?;
            spawned.insert(agent.name.clone(), json!(agent_id));
        }

        // Persist the name → id map.
        let mut final_record = record;
        final_record.agents = spawned.clone();
        self.write(&orch_id, &final_record)?;

        info!(orchestration = %orch_id, pattern = %pattern_name, agents = spawned.len(), "orchestration started");
        api.emit(
            EventName::parse("orchestration:started")
                .map_err(|e| KsiError::internal(e.to_string()))?,
            json!({"orchestration_id": orch_id, "pattern": pattern_name}),
        );
        Ok(json!({
            "orchestration_id": orch_id,
            "pattern": pattern_name,
            "agents": spawned,
        }))
    }

    // -----------------------------------------------------------------------
    // orchestration:status
    // -----------------------------------------------------------------------

    fn status(&self, event: &Event) -> KsiResult<serde_json::Value> {
        let orch_id = required_orch(event)?;
        let record = self
            .read(&orch_id)?
            .ok_or_else(|| KsiError::not_found(format!("orchestration {orch_id}")))?;

        let mut members = Vec::new();
        let mut children = Vec::new();
        for edge in self
            .store
            .neighbors(&orch_ref(&orch_id), Some("owns"), Direction::Out, usize::MAX, None)
            .map_err(KsiError::from)?
            .edges
        {
            match edge.to.entity_type.as_str() {
                TYPE_AGENT => members.push(edge.to.id),
                TYPE_ORCH => children.push(edge.to.id),
                _ => {},
            }
        }
        Ok(json!({
            "orchestration_id": orch_id,
            "pattern": record.pattern,
            "state": record.state,
            "event_subscription_level": record.event_subscription_level,
            "error_subscription_level": record.error_subscription_level,
            "agents": record.agents,
            "members": members,
            "child_orchestrations": children,
            "termination_requested": record.termination_requested,
        }))
    }

    // -----------------------------------------------------------------------
    // orchestration:terminate
    // -----------------------------------------------------------------------

    async fn terminate(&self, event: &Event, api: &HandlerApi) -> KsiResult<serde_json::Value> {
        let orch_id = required_orch(event)?;
        let mut record = self
            .read(&orch_id)?
            .ok_or_else(|| KsiError::not_found(format!("orchestration {orch_id}")))?;
        if record.state == "terminated" {
            return Err(KsiError::conflict(format!(
                "orchestration {orch_id} already terminated"
            )));
        }
        record.state = "terminating".to_owned();
        self.write(&orch_id, &record)?;

        // Post-order: child orchestrations, then member agents, then us.
        let mut child_orchs = Vec::new();
        let mut member_agents = Vec::new();
        for edge in self
            .store
            .neighbors(&orch_ref(&orch_id), Some("owns"), Direction::Out, usize::MAX, None)
            .map_err(KsiError::from)?
            .edges
        {
            match edge.to.entity_type.as_str() {
                TYPE_ORCH => child_orchs.push(OrchestrationId::from(edge.to.id.as_str())),
                TYPE_AGENT => member_agents.push(AgentId::from(edge.to.id.as_str())),
                _ => {},
            }
        }

        for child in child_orchs {
            let outcome = api
                .call(
                    EventName::parse("orchestration:terminate")
                        .map_err(|e| KsiError::internal(e.to_string()))?,
                    json!({"orchestration_id": child}),
                )
                .await;
            if let Err(e) = outcome {
                warn!(orchestration = %child, error = %e, "child orchestration termination failed");
            }
        }
        for agent in member_agents {
            let outcome = api
                .call(
                    EventName::parse("agent:terminate")
                        .map_err(|e| KsiError::internal(e.to_string()))?,
                    json!({"agent_id": agent, "cascade": true}),
                )
                .await;
            if let Err(e) = outcome {
                warn!(agent = %agent, error = %e, "member termination failed");
            }
            self.orchestrations.unbind_agent(&agent);
        }

        // Stop bubbling, then delete the entity (edges go with it).
        self.orchestrations.remove(&orch_id);
        self.store
            .delete_entity(&orch_ref(&orch_id), false)
            .map_err(KsiError::from)?;

        info!(orchestration = %orch_id, "orchestration terminated");
        api.emit(
            EventName::parse("orchestration:terminated")
                .map_err(|e| KsiError::internal(e.to_string()))?,
            json!({"orchestration_id": orch_id}),
        );
        Ok(json!({"orchestration_id": orch_id, "state": "terminated"}))
    }

    // -----------------------------------------------------------------------
    // orchestration:request_termination
    // -----------------------------------------------------------------------

    fn request_termination(&self, event: &Event, api: &HandlerApi) -> KsiResult<serde_json::Value> {
        let orch_id = required_orch(event)?;
        let mut record = self
            .read(&orch_id)?
            .ok_or_else(|| KsiError::not_found(format!("orchestration {orch_id}")))?;
        record.termination_requested = true;
        self.write(&orch_id, &record)?;
        let reason = event
            .data
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("unspecified");
        // The request bubbles to the orchestrator like any subtree event.
        api.emit(
            EventName::parse("orchestration:terminate_requested")
                .map_err(|e| KsiError::internal(e.to_string()))?,
            json!({"orchestration_id": orch_id, "reason": reason}),
        );
        Ok(json!({"orchestration_id": orch_id, "status": "requested"}))
    }
}

fn required_orch(event: &Event) -> KsiResult<OrchestrationId> {
    event
        .data
        .get("orchestration_id")
        .and_then(|v| v.as_str())
        .map(OrchestrationId::from)
        .ok_or_else(|| KsiError::invalid_argument("orchestration_id required"))
}
