//! The agent service and its event surface.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ksi_composition::ComponentLoader;
use ksi_config::AgentsSection;
use ksi_core::{
    AgentId, Capability, CapabilitySet, Event, EventName, EventOrigin, KsiError, KsiResult,
    OrchestrationId, SandboxId, SessionId,
};
use ksi_router::{
    CapabilityIndex, HandlerApi, HandlerRegistry, HandlerSpec, OrchestrationIndex, ParamSpec,
    ParamType, RouterHandle,
};
use ksi_store::{Direction, EntityRef, Store, UpdateMode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::sandbox::SandboxManager;
use crate::state::AgentState;

const TYPE_AGENT: &str = "agent";
const TYPE_REQUEST: &str = "request";

fn agent_ref(id: &AgentId) -> EntityRef {
    EntityRef::new(TYPE_AGENT, id.as_str())
}

/// Persisted shape of an agent entity's property bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AgentRecord {
    state: AgentState,
    profile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
    sandbox_id: SandboxId,
    sandbox_path: String,
    capabilities: CapabilitySet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_session: Option<SessionId>,
    created_at: DateTime<Utc>,
}

struct Inner {
    store: Arc<Store>,
    loader: Arc<ComponentLoader>,
    capabilities: Arc<CapabilityIndex>,
    orchestrations: Arc<OrchestrationIndex>,
    router: RouterHandle,
    config: AgentsSection,
    sandboxes: SandboxManager,
    inboxes: DashMap<AgentId, mpsc::Sender<String>>,
}

/// The agent service handle.
#[derive(Clone)]
pub struct AgentService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AgentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentService").finish_non_exhaustive()
    }
}

impl AgentService {
    /// Assemble the service.
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        loader: Arc<ComponentLoader>,
        capabilities: Arc<CapabilityIndex>,
        orchestrations: Arc<OrchestrationIndex>,
        router: RouterHandle,
        config: AgentsSection,
    ) -> Self {
        let sandboxes = SandboxManager::new(config.sandbox_root.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                loader,
                capabilities,
                orchestrations,
                router,
                config,
                sandboxes,
                inboxes: DashMap::new(),
            }),
        }
    }

    /// The sandbox manager (shared with any file surface).
    #[must_use]
    pub fn sandboxes(&self) -> &SandboxManager {
        &self.inner.sandboxes
    }

    /// Register the `agent:*` handlers.
    pub fn register_handlers(&self, registry: &Arc<HandlerRegistry>) {
        let spawn = Arc::clone(&self.inner);
        registry.register_fn(
            HandlerSpec::new("agent:spawn", "Spawn an agent from a composition profile")
                .param(ParamSpec::optional("component", ParamType::String, "profile component name"))
                .param(ParamSpec::optional("profile", ParamType::String, "alias for component"))
                .param(ParamSpec::optional("agent_id", ParamType::String, "explicit agent id"))
                .param(ParamSpec::optional("parent_agent_id", ParamType::String, "spawning parent"))
                .param(ParamSpec::optional("orchestration_id", ParamType::String, "owning orchestration"))
                .param(ParamSpec::optional("initial_prompt", ParamType::String, "first inbox message"))
                .param(ParamSpec::optional("capabilities", ParamType::Array, "extra grants from the parent"))
                .param(ParamSpec::optional("vars", ParamType::Object, "composition variable overrides"))
                .emits("agent:ready")
                .requires(Capability::spawn_agents()),
            move |event: Event, api| {
                let inner = Arc::clone(&spawn);
                async move { inner.spawn(&event, &api).await }
            },
        );

        let send = Arc::clone(&self.inner);
        registry.register_fn(
            HandlerSpec::new("agent:send_message", "Deliver a message to an agent's inbox")
                .param(ParamSpec::required("agent_id", ParamType::String, "target agent"))
                .param(ParamSpec::required("message", ParamType::String, "message text")),
            move |event: Event, _api| {
                let inner = Arc::clone(&send);
                async move { inner.send_message(&event).await }
            },
        );

        let terminate = Arc::clone(&self.inner);
        registry.register_fn(
            HandlerSpec::new("agent:terminate", "Terminate an agent")
                .param(ParamSpec::required("agent_id", ParamType::String, "agent to terminate"))
                .param(ParamSpec::optional("cascade", ParamType::Boolean, "terminate child agents too"))
                .emits("agent:terminated"),
            move |event: Event, api| {
                let inner = Arc::clone(&terminate);
                async move { inner.terminate(&event, &api).await }
            },
        );

        let list = Arc::clone(&self.inner);
        registry.register_fn(
            HandlerSpec::new("agent:list", "List known agents"),
            move |_event: Event, _api| {
                let inner = Arc::clone(&list);
                async move { inner.list() }
            },
        );

        let get = Arc::clone(&self.inner);
        registry.register_fn(
            HandlerSpec::new("agent:get", "One agent's full record").param(ParamSpec::required(
                "agent_id",
                ParamType::String,
                "agent to read",
            )),
            move |event: Event, _api| {
                let inner = Arc::clone(&get);
                async move { inner.get(&event) }
            },
        );
    }

    /// Restart reconciliation: rebind capability sets and restart inbox
    /// workers for live agents; agents caught mid-spawn are terminated.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn recover(&self) -> KsiResult<usize> {
        let mut revived = 0;
        for id in self.inner.store.entity_ids_of_type(TYPE_AGENT)? {
            let agent_id = AgentId::from(id);
            let Some(record) = self.inner.read(&agent_id)? else {
                continue;
            };
            match record.state {
                AgentState::Spawning => {
                    // Caught mid-spawn by a crash; never went live.
                    let mut dead = record.clone();
                    dead.state = AgentState::Terminated;
                    self.inner.write(&agent_id, &dead)?;
                    let _ = self.inner.sandboxes.remove(&record.sandbox_id);
                },
                AgentState::Terminating => {
                    // Finish the interrupted termination.
                    let mut dead = record.clone();
                    dead.state = AgentState::Terminated;
                    self.inner.write(&agent_id, &dead)?;
                    let _ = self.inner.sandboxes.remove(&record.sandbox_id);
                },
                AgentState::Terminated => {},
                _ => {
                    self.inner
                        .capabilities
                        .bind(agent_id.clone(), record.capabilities.clone());
                    self.inner.start_inbox(&agent_id);
                    revived += 1;
                },
            }
        }
        info!(revived, "agent recovery finished");
        Ok(revived)
    }
}

impl Inner {
    fn read(&self, agent_id: &AgentId) -> KsiResult<Option<AgentRecord>> {
        Ok(self
            .store
            .get_entity(&agent_ref(agent_id))
            .map_err(KsiError::from)?
            .map(|e| serde_json::from_value(serde_json::Value::Object(e.properties)))
            .transpose()?)
    }

    fn write(&self, agent_id: &AgentId, record: &AgentRecord) -> KsiResult<()> {
        let serde_json::Value::Object(props) = serde_json::to_value(record)? else {
            return Err(KsiError::internal("agent record must serialize to an object"));
        };
        self.store
            .update_entity(&agent_ref(agent_id), props, UpdateMode::Replace)
            .map_err(KsiError::from)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // agent:spawn
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    async fn spawn(&self, event: &Event, api: &HandlerApi) -> KsiResult<serde_json::Value> {
        let data = &event.data;
        let component = data
            .get("component")
            .or_else(|| data.get("profile"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| KsiError::invalid_argument("component (or profile) required"))?;

        let vars = match data.get("vars") {
            None => std::collections::BTreeMap::new(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| KsiError::invalid_argument(format!("vars: {e}")))?,
        };
        let profile = self
            .loader
            .resolve_with_vars(component, &vars)
            .map_err(KsiError::from)?
            .as_profile()
            .map_err(KsiError::from)?;

        // Capability resolution: composition plus parental grants. An
        // agent can only grant capabilities it holds itself.
        let mut grants = CapabilitySet::new();
        if let Some(requested) = data.get("capabilities") {
            let requested: Vec<Capability> = serde_json::from_value(requested.clone())
                .map_err(|e| KsiError::invalid_argument(format!("capabilities: {e}")))?;
            for capability in requested {
                let allowed = match &event.context.agent_id {
                    Some(caller) => self.capabilities.holds(caller, &capability),
                    None => true,
                };
                if !allowed {
                    return Err(KsiError::permission_denied(format!(
                        "cannot grant {capability}: the spawning agent does not hold it"
                    )));
                }
                grants.grant(capability);
            }
        }
        let active = profile.capabilities.union(&grants);

        let parent = data
            .get("parent_agent_id")
            .and_then(|v| v.as_str())
            .map(AgentId::from)
            .or_else(|| event.context.agent_id.clone());
        let orchestration = data
            .get("orchestration_id")
            .and_then(|v| v.as_str())
            .map(OrchestrationId::from)
            .or_else(|| event.context.orchestration_id.clone());

        // Spawn caps.
        if let Some(parent) = &parent {
            let children = self
                .store
                .neighbors(&agent_ref(parent), Some("parent_of"), Direction::Out, usize::MAX, None)
                .map_err(KsiError::from)?;
            if children.edges.len() >= self.config.max_children_per_parent {
                return Err(KsiError::capacity(format!(
                    "agent {parent} is at its child cap of {}",
                    self.config.max_children_per_parent
                )));
            }
        }
        if let Some(orchestration) = &orchestration {
            let orch_ref = EntityRef::new("orchestration", orchestration.as_str());
            let members = self
                .store
                .neighbors(&orch_ref, Some("owns"), Direction::Out, usize::MAX, None)
                .map_err(KsiError::from)?;
            if members.edges.len() >= self.config.max_agents_per_orchestration {
                return Err(KsiError::capacity(format!(
                    "orchestration {orchestration} is at its agent cap of {}",
                    self.config.max_agents_per_orchestration
                )));
            }
        }

        let agent_id = data
            .get("agent_id")
            .and_then(|v| v.as_str())
            .map_or_else(AgentId::new, AgentId::from);
        let sandbox_id = SandboxId::new();

        // Persist the entity in `spawning` first: the id is reserved
        // before any filesystem or wiring work, and a crash from here on
        // leaves a record that recovery terminates.
        let mut record = AgentRecord {
            state: AgentState::Spawning,
            profile: component.to_owned(),
            model: profile.model,
            prompt: profile.prompt,
            sandbox_id: sandbox_id.clone(),
            sandbox_path: self.sandboxes.path_for(&sandbox_id).display().to_string(),
            capabilities: active.clone(),
            current_session: None,
            created_at: Utc::now(),
        };
        let serde_json::Value::Object(props) = serde_json::to_value(&record)? else {
            return Err(KsiError::internal("agent record must serialize to an object"));
        };
        self.store
            .create_entity(&agent_ref(&agent_id), props)
            .map_err(KsiError::from)?;

        self.sandboxes.allocate(&sandbox_id)?;

        // Graph wiring.
        let empty = serde_json::Map::new;
        if let Some(parent) = &parent {
            self.store
                .create_relationship(&agent_ref(parent), "parent_of", &agent_ref(&agent_id), empty())
                .map_err(KsiError::from)?;
            self.store
                .create_relationship(&agent_ref(parent), "spawned", &agent_ref(&agent_id), empty())
                .map_err(KsiError::from)?;
        }
        if let Some(orchestration) = &orchestration {
            let orch_ref = EntityRef::new("orchestration", orchestration.as_str());
            if self.store.get_entity(&orch_ref).map_err(KsiError::from)?.is_some() {
                self.store
                    .create_relationship(&orch_ref, "owns", &agent_ref(&agent_id), empty())
                    .map_err(KsiError::from)?;
            }
            self.orchestrations.bind_agent(agent_id.clone(), orchestration.clone());
        }

        self.capabilities.bind(agent_id.clone(), active);
        self.start_inbox(&agent_id);

        // Wiring is complete; the agent is live.
        record.state = AgentState::Ready;
        self.write(&agent_id, &record)?;

        if let Some(initial) = data.get("initial_prompt").and_then(|v| v.as_str()) {
            self.deliver(&agent_id, initial).await?;
        }

        info!(agent = %agent_id, profile = %component, "agent spawned");
        api.emit(
            EventName::parse("agent:ready").map_err(|e| KsiError::internal(e.to_string()))?,
            json!({"agent_id": agent_id, "profile": component}),
        );
        Ok(json!({
            "agent_id": agent_id,
            "sandbox_id": sandbox_id,
            "sandbox_path": record.sandbox_path,
            "state": AgentState::Ready,
        }))
    }

    // -----------------------------------------------------------------------
    // Inbox
    // -----------------------------------------------------------------------

    fn start_inbox(&self, agent_id: &AgentId) {
        let (tx, mut rx) = mpsc::channel::<String>(self.config.inbox_capacity);
        self.inboxes.insert(agent_id.clone(), tx);
        let router = self.router.clone();
        let agent = agent_id.clone();
        tokio::spawn(async move {
            debug!(agent = %agent, "inbox worker started");
            while let Some(message) = rx.recv().await {
                // Each message becomes a completion on the agent's current
                // session; the event is agent-originated so capability
                // gating applies end to end.
                if let Ok(name) = EventName::parse("completion:async") {
                    router.emit(
                        name,
                        json!({"agent_id": agent, "prompt": message}),
                        EventOrigin::Agent(agent.clone()),
                    );
                }
            }
            debug!(agent = %agent, "inbox worker stopped");
        });
    }

    async fn deliver(&self, agent_id: &AgentId, message: &str) -> KsiResult<()> {
        let Some(tx) = self.inboxes.get(agent_id).map(|t| t.value().clone()) else {
            return Err(KsiError::not_found(format!("agent {agent_id} has no live inbox")));
        };
        tx.try_send(message.to_owned()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                KsiError::capacity(format!("agent {agent_id} inbox is full"))
            },
            mpsc::error::TrySendError::Closed(_) => {
                KsiError::not_found(format!("agent {agent_id} inbox is closed"))
            },
        })
    }

    async fn send_message(&self, event: &Event) -> KsiResult<serde_json::Value> {
        let agent_id = required_agent(event)?;
        let message = event
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KsiError::invalid_argument("message required"))?;
        let record = self
            .read(&agent_id)?
            .ok_or_else(|| KsiError::not_found(format!("agent {agent_id}")))?;
        if !record.state.accepts_messages() {
            return Err(KsiError::conflict(format!(
                "agent {agent_id} is not accepting messages"
            )));
        }
        self.deliver(&agent_id, message).await?;
        Ok(json!({"agent_id": agent_id, "status": "queued"}))
    }

    // -----------------------------------------------------------------------
    // agent:terminate
    // -----------------------------------------------------------------------

    async fn terminate(&self, event: &Event, api: &HandlerApi) -> KsiResult<serde_json::Value> {
        let agent_id = required_agent(event)?;
        let cascade = event
            .data
            .get("cascade")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let mut record = self
            .read(&agent_id)?
            .ok_or_else(|| KsiError::not_found(format!("agent {agent_id}")))?;
        if record.state == AgentState::Terminated {
            return Err(KsiError::conflict(format!("agent {agent_id} already terminated")));
        }

        record.state = AgentState::Terminating;
        self.write(&agent_id, &record)?;

        // Stop taking messages before cancelling work.
        self.inboxes.remove(&agent_id);

        // Children go first (post-order) so no descendant outlives us.
        if cascade {
            let children = self
                .store
                .neighbors(&agent_ref(&agent_id), Some("parent_of"), Direction::Out, usize::MAX, None)
                .map_err(KsiError::from)?;
            for edge in children.edges {
                let child = AgentId::from(edge.to.id.as_str());
                let outcome = api
                    .call(
                        EventName::parse("agent:terminate")
                            .map_err(|e| KsiError::internal(e.to_string()))?,
                        json!({"agent_id": child, "cascade": true}),
                    )
                    .await;
                if let Err(e) = outcome {
                    warn!(agent = %child, error = %e, "child termination failed");
                }
            }
        }

        // Cancel the agent's in-flight completions through the normal
        // event surface.
        for request in self.open_requests(&agent_id)? {
            let outcome = api
                .call(
                    EventName::parse("completion:cancel")
                        .map_err(|e| KsiError::internal(e.to_string()))?,
                    json!({"request_id": request}),
                )
                .await;
            if let Err(e) = outcome {
                debug!(request = %request, error = %e, "cancel during termination failed");
            }
        }

        self.capabilities.unbind(&agent_id);
        self.orchestrations.unbind_agent(&agent_id);
        let _ = self.sandboxes.remove(&record.sandbox_id);

        record.state = AgentState::Terminated;
        self.write(&agent_id, &record)?;

        info!(agent = %agent_id, cascade, "agent terminated");
        api.emit(
            EventName::parse("agent:terminated").map_err(|e| KsiError::internal(e.to_string()))?,
            json!({"agent_id": agent_id}),
        );
        Ok(json!({"agent_id": agent_id, "state": AgentState::Terminated}))
    }

    /// Non-terminal request ids attributed to `agent_id`.
    fn open_requests(&self, agent_id: &AgentId) -> KsiResult<Vec<String>> {
        #[derive(Deserialize)]
        struct Slim {
            request_id: String,
            #[serde(default)]
            agent_id: Option<String>,
            status: String,
        }
        let mut out = Vec::new();
        for entity in self.store.entities_of_type(TYPE_REQUEST).map_err(KsiError::from)? {
            let Ok(slim) =
                serde_json::from_value::<Slim>(serde_json::Value::Object(entity.properties))
            else {
                continue;
            };
            let open = matches!(slim.status.as_str(), "pending" | "active");
            if open && slim.agent_id.as_deref() == Some(agent_id.as_str()) {
                out.push(slim.request_id);
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Agents with any in-flight request (for derived `running` state).
    fn busy_agents(&self) -> KsiResult<std::collections::HashSet<String>> {
        #[derive(Deserialize)]
        struct Slim {
            #[serde(default)]
            agent_id: Option<String>,
            status: String,
        }
        let mut busy = std::collections::HashSet::new();
        for entity in self.store.entities_of_type(TYPE_REQUEST).map_err(KsiError::from)? {
            let Ok(slim) =
                serde_json::from_value::<Slim>(serde_json::Value::Object(entity.properties))
            else {
                continue;
            };
            if matches!(slim.status.as_str(), "pending" | "active") {
                if let Some(agent) = slim.agent_id {
                    busy.insert(agent);
                }
            }
        }
        Ok(busy)
    }

    fn effective_state(record: &AgentRecord, busy: bool) -> AgentState {
        match record.state {
            AgentState::Ready | AgentState::Running | AgentState::Idle => {
                if busy {
                    AgentState::Running
                } else {
                    AgentState::Idle
                }
            },
            other => other,
        }
    }

    fn list(&self) -> KsiResult<serde_json::Value> {
        let busy = self.busy_agents()?;
        let mut agents = Vec::new();
        for id in self.store.entity_ids_of_type(TYPE_AGENT).map_err(KsiError::from)? {
            let agent_id = AgentId::from(id.as_str());
            let Some(record) = self.read(&agent_id)? else {
                continue;
            };
            agents.push(json!({
                "agent_id": agent_id,
                "state": Self::effective_state(&record, busy.contains(&id)),
                "profile": record.profile,
                "current_session": record.current_session,
            }));
        }
        Ok(json!({"agents": agents}))
    }

    fn get(&self, event: &Event) -> KsiResult<serde_json::Value> {
        let agent_id = required_agent(event)?;
        let record = self
            .read(&agent_id)?
            .ok_or_else(|| KsiError::not_found(format!("agent {agent_id}")))?;
        let busy = self.busy_agents()?.contains(agent_id.as_str());
        Ok(json!({
            "agent_id": agent_id,
            "state": Self::effective_state(&record, busy),
            "profile": record.profile,
            "model": record.model,
            "sandbox_id": record.sandbox_id,
            "sandbox_path": record.sandbox_path,
            "capabilities": record.capabilities,
            "current_session": record.current_session,
            "created_at": record.created_at,
        }))
    }
}

fn required_agent(event: &Event) -> KsiResult<AgentId> {
    event
        .data
        .get("agent_id")
        .and_then(|v| v.as_str())
        .map(AgentId::from)
        .ok_or_else(|| KsiError::invalid_argument("agent_id required"))
}
