//! Daemon-level event surfaces: shared state, compositions, health,
//! transformer reload.

use std::sync::Arc;
use std::time::Instant;

use ksi_composition::{ComponentLoader, ComponentType};
use ksi_core::{Capability, Event, KsiError, KsiResult};
use ksi_router::{
    HandlerRegistry, HandlerSpec, ParamSpec, ParamType, TransformerRegistry, TransformerRule,
    TransformerSet,
};
use ksi_store::{EntityRef, Store, UpdateMode};
use serde_json::json;
use tracing::info;

// ---------------------------------------------------------------------------
// state:* — the KV surface
// ---------------------------------------------------------------------------

/// Namespaces reserved for the daemon's own records.
const RESERVED_NS: [&str; 2] = ["log_meta", "ksi"];

fn state_ns(event: &Event) -> KsiResult<String> {
    let ns = event
        .data
        .get("namespace")
        .and_then(|v| v.as_str())
        .unwrap_or("default")
        .to_owned();
    if RESERVED_NS.contains(&ns.as_str()) {
        return Err(KsiError::permission_denied(format!("namespace {ns:?} is reserved")));
    }
    Ok(ns)
}

/// Register `state:get` / `state:set` / `state:delete` / `state:list`.
pub fn register_state_handlers(registry: &Arc<HandlerRegistry>, store: &Arc<Store>) {
    let get_store = Arc::clone(store);
    registry.register_fn(
        HandlerSpec::new("state:get", "Read a shared state value")
            .param(ParamSpec::optional("namespace", ParamType::String, "key namespace"))
            .param(ParamSpec::required("key", ParamType::String, "key to read")),
        move |event: Event, _api| {
            let store = Arc::clone(&get_store);
            async move {
                let ns = state_ns(&event)?;
                let key = required_str(&event, "key")?;
                let value: Option<serde_json::Value> =
                    store.get_json(&ns, &key).map_err(KsiError::from)?;
                match value {
                    Some(value) => Ok(json!({"namespace": ns, "key": key, "value": value})),
                    None => Err(KsiError::not_found(format!("{ns}/{key}"))),
                }
            }
        },
    );

    let set_store = Arc::clone(store);
    registry.register_fn(
        HandlerSpec::new("state:set", "Write a shared state value")
            .param(ParamSpec::optional("namespace", ParamType::String, "key namespace"))
            .param(ParamSpec::required("key", ParamType::String, "key to write"))
            .requires(Capability::state_write()),
        move |event: Event, _api| {
            let store = Arc::clone(&set_store);
            async move {
                let ns = state_ns(&event)?;
                let key = required_str(&event, "key")?;
                let value = event
                    .data
                    .get("value")
                    .ok_or_else(|| KsiError::invalid_argument("value required"))?;
                store.set_json(&ns, &key, value).map_err(KsiError::from)?;
                Ok(json!({"namespace": ns, "key": key, "stored": true}))
            }
        },
    );

    let delete_store = Arc::clone(store);
    registry.register_fn(
        HandlerSpec::new("state:delete", "Delete a shared state value")
            .param(ParamSpec::optional("namespace", ParamType::String, "key namespace"))
            .param(ParamSpec::required("key", ParamType::String, "key to delete"))
            .requires(Capability::state_write()),
        move |event: Event, _api| {
            let store = Arc::clone(&delete_store);
            async move {
                let ns = state_ns(&event)?;
                let key = required_str(&event, "key")?;
                let existed = store.delete(&ns, &key).map_err(KsiError::from)?;
                Ok(json!({"namespace": ns, "key": key, "deleted": existed}))
            }
        },
    );

    let list_store = Arc::clone(store);
    registry.register_fn(
        HandlerSpec::new("state:list", "List shared state keys")
            .param(ParamSpec::optional("namespace", ParamType::String, "key namespace"))
            .param(ParamSpec::optional("pattern", ParamType::String, "glob over keys"))
            .param(ParamSpec::optional("limit", ParamType::Integer, "page size"))
            .param(ParamSpec::optional("token", ParamType::String, "continuation token")),
        move |event: Event, _api| {
            let store = Arc::clone(&list_store);
            async move {
                let ns = state_ns(&event)?;
                let pattern = event.data.get("pattern").and_then(|v| v.as_str());
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let limit = event
                    .data
                    .get("limit")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(100) as usize;
                let token = event.data.get("token").and_then(|v| v.as_str());
                let page = store
                    .list(&ns, pattern, limit, token)
                    .map_err(KsiError::from)?;
                let keys: Vec<&str> = page.entries.iter().map(|(k, _)| k.as_str()).collect();
                Ok(json!({
                    "namespace": ns,
                    "keys": keys,
                    "next_token": page.next_token,
                }))
            }
        },
    );
}

// ---------------------------------------------------------------------------
// composition:*
// ---------------------------------------------------------------------------

/// Register `composition:get` / `composition:list` /
/// `composition:reload` / `composition:rebuild_index`.
pub fn register_composition_handlers(
    registry: &Arc<HandlerRegistry>,
    store: &Arc<Store>,
    loader: &Arc<ComponentLoader>,
) {
    let get_loader = Arc::clone(loader);
    registry.register_fn(
        HandlerSpec::new("composition:get", "One resolved composition in canonical form").param(
            ParamSpec::required("name", ParamType::String, "component name"),
        ),
        move |event: Event, _api| {
            let loader = Arc::clone(&get_loader);
            async move {
                let name = required_str(&event, "name")?;
                let component = loader.resolve(&name).map_err(KsiError::from)?;
                Ok(serde_json::to_value(component.as_ref())?)
            }
        },
    );

    let list_loader = Arc::clone(loader);
    registry.register_fn(
        HandlerSpec::new("composition:list", "All known compositions"),
        move |_event: Event, _api| {
            let loader = Arc::clone(&list_loader);
            async move {
                let components: Vec<serde_json::Value> = loader
                    .list()
                    .into_iter()
                    .map(|(name, version, component_type)| {
                        json!({
                            "name": name,
                            "version": version,
                            "component_type": component_type,
                        })
                    })
                    .collect();
                Ok(json!({"total": components.len(), "compositions": components}))
            }
        },
    );

    let reload_loader = Arc::clone(loader);
    registry.register_fn(
        HandlerSpec::new("composition:reload", "Re-scan the content tree"),
        move |_event: Event, _api| {
            let loader = Arc::clone(&reload_loader);
            async move {
                loader.reload().map_err(KsiError::from)?;
                Ok(json!({"reloaded": true, "total": loader.list().len()}))
            }
        },
    );

    let index_loader = Arc::clone(loader);
    let index_store = Arc::clone(store);
    registry.register_fn(
        HandlerSpec::new("composition:rebuild_index", "Re-index compositions into the graph"),
        move |_event: Event, _api| {
            let loader = Arc::clone(&index_loader);
            let store = Arc::clone(&index_store);
            async move {
                let mut indexed = 0;
                for (name, version, component_type) in loader.list() {
                    let entity = EntityRef::new("composition", &name);
                    let mut props = serde_json::Map::new();
                    props.insert("name".to_owned(), json!(name));
                    props.insert("version".to_owned(), json!(version));
                    props.insert("component_type".to_owned(), json!(component_type));
                    match store.update_entity(&entity, props.clone(), UpdateMode::Replace) {
                        Ok(_) => {},
                        Err(ksi_store::StoreError::NotFound(_)) => {
                            store.create_entity(&entity, props).map_err(KsiError::from)?;
                        },
                        Err(e) => return Err(e.into()),
                    }
                    indexed += 1;
                }
                info!(indexed, "composition index rebuilt");
                Ok(json!({"indexed": indexed}))
            }
        },
    );
}

// ---------------------------------------------------------------------------
// transformer:reload
// ---------------------------------------------------------------------------

/// Compile every `transformer_set` composition into one rule set.
pub fn load_transformer_sets(loader: &ComponentLoader) -> KsiResult<TransformerSet> {
    let mut rules: Vec<TransformerRule> = Vec::new();
    for (name, _, component_type) in loader.list() {
        if component_type != ComponentType::TransformerSet {
            continue;
        }
        let component = loader.resolve(&name).map_err(KsiError::from)?;
        if let Some(list) = component.body.get("transformers") {
            let parsed: Vec<TransformerRule> = serde_json::from_value(list.clone())
                .map_err(|e| KsiError::invalid_argument(format!("{name}: {e}")))?;
            rules.extend(parsed);
        }
    }
    TransformerSet::compile(rules).map_err(KsiError::from)
}

/// Register `transformer:reload` — validate, then swap atomically.
pub fn register_transformer_reload(
    registry: &Arc<HandlerRegistry>,
    loader: &Arc<ComponentLoader>,
    transformers: &Arc<TransformerRegistry>,
) {
    let loader = Arc::clone(loader);
    let transformers = Arc::clone(transformers);
    registry.register_fn(
        HandlerSpec::new("transformer:reload", "Reload the declarative routing rules")
            .requires(Capability::transformer_reload()),
        move |_event: Event, _api| {
            let loader = Arc::clone(&loader);
            let transformers = Arc::clone(&transformers);
            async move {
                loader.reload().map_err(KsiError::from)?;
                let set = load_transformer_sets(&loader)?;
                let rules = set.len();
                transformers.swap(set);
                info!(rules, "transformer rules swapped");
                Ok(json!({"rules": rules}))
            }
        },
    );
}

// ---------------------------------------------------------------------------
// system:health
// ---------------------------------------------------------------------------

/// Register `system:health`.
pub fn register_system_handlers(registry: &Arc<HandlerRegistry>, store: &Arc<Store>) {
    let started = Instant::now();
    let store = Arc::clone(store);
    registry.register_fn(
        HandlerSpec::new("system:health", "Daemon liveness and store stats"),
        move |_event: Event, _api| {
            let store = Arc::clone(&store);
            let uptime = started.elapsed();
            async move {
                let agents = store.entity_ids_of_type("agent").map_err(KsiError::from)?.len();
                let orchestrations = store
                    .entity_ids_of_type("orchestration")
                    .map_err(KsiError::from)?
                    .len();
                let sessions = store.entity_ids_of_type("session").map_err(KsiError::from)?.len();
                Ok(json!({
                    "status": "ok",
                    "uptime_secs": uptime.as_secs(),
                    "entities": {
                        "agents": agents,
                        "orchestrations": orchestrations,
                        "sessions": sessions,
                    },
                }))
            }
        },
    );
}

fn required_str(event: &Event, key: &str) -> KsiResult<String> {
    event
        .data
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| KsiError::invalid_argument(format!("{key} required")))
}
