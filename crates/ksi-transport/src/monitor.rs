//! Subscription management events.
//!
//! `monitor:subscribe` / `monitor:unsubscribe` attach glob subscriptions
//! to the calling connection's writer; `observation:subscribe` is the
//! agent-scoped variant. Subscriptions die with the connection (the
//! server reaps them on disconnect) — durability across restarts is not
//! offered here.

use std::sync::Arc;

use ksi_core::{AgentId, Event, KsiError, KsiResult, OrchestrationId, SubscriberId};
use ksi_router::{
    HandlerRegistry, HandlerSpec, ParamSpec, ParamType, Subscription, SubscriptionRegistry,
    SubscriptionScope,
};
use serde_json::json;

use crate::server::ClientRegistry;

/// Register `monitor:subscribe`, `monitor:unsubscribe` and
/// `observation:subscribe`.
pub fn register_monitor_handlers(
    registry: &Arc<HandlerRegistry>,
    clients: &Arc<ClientRegistry>,
    subscriptions: &Arc<SubscriptionRegistry>,
) {
    let sub_clients = Arc::clone(clients);
    let sub_subs = Arc::clone(subscriptions);
    registry.register_fn(
        HandlerSpec::new("monitor:subscribe", "Subscribe this connection to an event stream")
            .param(ParamSpec::required(
                "patterns",
                ParamType::Array,
                "glob patterns over event names",
            ))
            .param(ParamSpec::optional(
                "agent_id",
                ParamType::String,
                "restrict to one agent's events",
            ))
            .param(ParamSpec::optional(
                "orchestration_id",
                ParamType::String,
                "restrict to one orchestration subtree",
            ))
            .param(ParamSpec::optional(
                "depth",
                ParamType::Integer,
                "subtree depth bound (-1 = all)",
            ))
            .param(ParamSpec::optional(
                "filters",
                ParamType::Object,
                "equality filters over top-level data fields",
            )),
        move |event: Event, _api| {
            let clients = Arc::clone(&sub_clients);
            let subs = Arc::clone(&sub_subs);
            async move { subscribe(&clients, &subs, &event, None).await }
        },
    );

    let obs_clients = Arc::clone(clients);
    let obs_subs = Arc::clone(subscriptions);
    registry.register_fn(
        HandlerSpec::new("observation:subscribe", "Subscribe to a single agent's events")
            .param(ParamSpec::required(
                "agent_id",
                ParamType::String,
                "agent to observe",
            ))
            .param(ParamSpec::optional(
                "patterns",
                ParamType::Array,
                "glob patterns (default: everything)",
            )),
        move |event: Event, _api| {
            let clients = Arc::clone(&obs_clients);
            let subs = Arc::clone(&obs_subs);
            async move {
                let agent = event
                    .data
                    .get("agent_id")
                    .and_then(|v| v.as_str())
                    .map(AgentId::from)
                    .ok_or_else(|| KsiError::invalid_argument("agent_id required"))?;
                subscribe(&clients, &subs, &event, Some(SubscriptionScope::Agent(agent))).await
            }
        },
    );

    let unsub_subs = Arc::clone(subscriptions);
    registry.register_fn(
        HandlerSpec::new("monitor:unsubscribe", "Remove one subscription").param(
            ParamSpec::required("subscriber_id", ParamType::String, "id returned by subscribe"),
        ),
        move |event: Event, _api| {
            let subs = Arc::clone(&unsub_subs);
            async move {
                let id = event
                    .data
                    .get("subscriber_id")
                    .and_then(|v| v.as_str())
                    .map(SubscriberId::from)
                    .ok_or_else(|| KsiError::invalid_argument("subscriber_id required"))?;
                if subs.remove(&id) {
                    Ok(json!({"unsubscribed": id}))
                } else {
                    Err(KsiError::not_found(format!("subscription {id}")))
                }
            }
        },
    );
}

async fn subscribe(
    clients: &ClientRegistry,
    subscriptions: &SubscriptionRegistry,
    event: &Event,
    forced_scope: Option<SubscriptionScope>,
) -> KsiResult<serde_json::Value> {
    let client_id = event
        .context
        .client_id
        .clone()
        .ok_or_else(|| KsiError::invalid_argument("subscriptions require a client connection"))?;
    let queue = clients
        .outbound(&client_id)
        .ok_or_else(|| KsiError::not_found(format!("no live connection for {client_id}")))?;

    let patterns: Vec<String> = match event.data.get("patterns") {
        None => vec!["*".to_owned()],
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| KsiError::invalid_argument(format!("patterns: {e}")))?,
    };

    let scope = match forced_scope {
        Some(scope) => scope,
        None => {
            if let Some(agent) = event.data.get("agent_id").and_then(|v| v.as_str()) {
                SubscriptionScope::Agent(AgentId::from(agent))
            } else if let Some(orch) = event.data.get("orchestration_id").and_then(|v| v.as_str()) {
                #[allow(clippy::cast_possible_truncation)]
                let depth = event
                    .data
                    .get("depth")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(-1) as i32;
                SubscriptionScope::Subtree {
                    orchestration_id: OrchestrationId::from(orch),
                    max_depth: depth,
                }
            } else {
                SubscriptionScope::Global
            }
        },
    };

    let filters = event
        .data
        .get("filters")
        .and_then(serde_json::Value::as_object)
        .cloned();

    let subscription = Subscription::new(
        SubscriberId::new(),
        Some(client_id),
        patterns.clone(),
        scope,
        filters,
        queue,
    )?;
    let id = subscriptions.add(subscription);
    Ok(json!({"subscriber_id": id, "patterns": patterns}))
}
