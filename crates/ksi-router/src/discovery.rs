//! Discovery and introspection handlers.
//!
//! Everything discovery exposes was declared at registration time, so
//! these handlers are pure reads over the registry — no reflection, no
//! source parsing. Full results are cached against the registry revision.

use std::sync::{Arc, Mutex};

use ksi_core::{Event, KsiError};
use serde_json::json;

use crate::registry::{HandlerRegistry, HandlerSpec, ParamSpec, ParamType};

/// Cached discovery payload, keyed by registry revision.
#[derive(Default)]
struct DiscoveryCache {
    inner: Mutex<Option<(u64, serde_json::Value)>>,
}

impl DiscoveryCache {
    fn get_or_build(
        &self,
        revision: u64,
        build: impl FnOnce() -> serde_json::Value,
    ) -> serde_json::Value {
        let mut guard = self.inner.lock().expect("discovery cache lock poisoned");
        if let Some((cached_revision, value)) = guard.as_ref() {
            if *cached_revision == revision {
                return value.clone();
            }
        }
        let value = build();
        *guard = Some((revision, value.clone()));
        value
    }
}

fn spec_summary(spec: &HandlerSpec) -> serde_json::Value {
    json!({
        "event": spec.event,
        "summary": spec.summary,
    })
}

fn spec_full(spec: &HandlerSpec) -> serde_json::Value {
    json!({
        "event": spec.event,
        "summary": spec.summary,
        "params": spec.params,
        "emits": spec.emits,
        "required_capability": spec.required_capability,
    })
}

/// Register `system:discover` and `system:help` over `registry`.
pub fn register_discovery_handlers(registry: &Arc<HandlerRegistry>) {
    let cache = Arc::new(DiscoveryCache::default());

    let discover_registry = Arc::clone(registry);
    let discover_cache = Arc::clone(&cache);
    registry.register_fn(
        HandlerSpec::new("system:discover", "List registered events and their schemas")
            .param(ParamSpec::optional(
                "namespace",
                ParamType::String,
                "restrict to one event namespace",
            ))
            .param(ParamSpec::optional(
                "event",
                ParamType::String,
                "restrict to one event name",
            ))
            .param(
                ParamSpec::optional("level", ParamType::String, "summary or full")
                    .with_allowed(vec![json!("summary"), json!("full")]),
            ),
        move |event: Event, _api| {
            let registry = Arc::clone(&discover_registry);
            let cache = Arc::clone(&discover_cache);
            async move {
                let level = event
                    .data
                    .get("level")
                    .and_then(|v| v.as_str())
                    .unwrap_or("summary");
                let namespace = event.data.get("namespace").and_then(|v| v.as_str());
                let only_event = event.data.get("event").and_then(|v| v.as_str());

                // The cache holds the unfiltered full listing; filters
                // apply on top of it.
                let revision = registry.revision();
                let full = cache.get_or_build(revision, || {
                    serde_json::Value::Array(registry.specs().iter().map(spec_full).collect())
                });
                let specs = registry.specs();
                let filtered: Vec<serde_json::Value> = specs
                    .iter()
                    .zip(full.as_array().cloned().unwrap_or_default())
                    .filter(|(spec, _)| {
                        namespace.is_none_or(|ns| spec.event.split(':').next() == Some(ns))
                            && only_event.is_none_or(|e| spec.event == e)
                    })
                    .map(|(spec, full)| {
                        if level == "full" {
                            full
                        } else {
                            spec_summary(spec)
                        }
                    })
                    .collect();
                Ok(json!({ "total": filtered.len(), "events": filtered }))
            }
        },
    );

    let help_registry = Arc::clone(registry);
    registry.register_fn(
        HandlerSpec::new("system:help", "Human-facing help for one event").param(
            ParamSpec::required("event", ParamType::String, "event name to describe"),
        ),
        move |event: Event, _api| {
            let registry = Arc::clone(&help_registry);
            async move {
                let wanted = event
                    .data
                    .get("event")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let matching: Vec<HandlerSpec> = registry
                    .specs()
                    .into_iter()
                    .filter(|s| s.event == wanted)
                    .collect();
                if matching.is_empty() {
                    return Err(KsiError::not_found(format!("no handler for {wanted}")));
                }
                let spec = &matching[0];
                let usage: Vec<String> = spec
                    .params
                    .iter()
                    .map(|p: &ParamSpec| {
                        let optional = if p.required { "" } else { " (optional)" };
                        format!("{}{}: {}", p.name, optional, p.description)
                    })
                    .collect();
                Ok(json!({
                    "event": spec.event,
                    "summary": spec.summary,
                    "usage": usage,
                    "emits": spec.emits,
                    "handlers": matching.len(),
                }))
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerRegistry;
    use ksi_core::{EventName, EventOrigin};
    use ksi_store::Store;

    async fn fixture() -> (crate::RouterHandle, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().unwrap());
        let log = Arc::new(crate::EventLog::open(dir.path(), store).unwrap());
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn(
            HandlerSpec::new("completion:async", "Queue a completion")
                .param(ParamSpec::required("prompt", ParamType::String, "prompt text"))
                .emits("completion:result"),
            |_e, _a| async { Ok(json!({})) },
        );
        register_discovery_handlers(&registry);
        let router = crate::Router::new(
            registry,
            log,
            Arc::new(crate::TransformerRegistry::new()),
            Arc::new(crate::SubscriptionRegistry::new()),
            Arc::new(crate::OrchestrationIndex::new()),
            Arc::new(crate::CapabilityIndex::new()),
        );
        let (handle, _join) = router.start();
        (handle, dir)
    }

    #[tokio::test]
    async fn test_discover_summary_and_namespace_filter() {
        let (handle, _dir) = fixture().await;
        let results = handle
            .submit(
                EventName::parse("system:discover").unwrap(),
                json!({"namespace": "completion"}),
                EventOrigin::System,
            )
            .await
            .unwrap();
        let listing = &results[0];
        assert_eq!(listing["total"], 1);
        assert_eq!(listing["events"][0]["event"], "completion:async");
        // Summary level omits params.
        assert!(listing["events"][0].get("params").is_none());
    }

    #[tokio::test]
    async fn test_discover_full_includes_schema() {
        let (handle, _dir) = fixture().await;
        let results = handle
            .submit(
                EventName::parse("system:discover").unwrap(),
                json!({"event": "completion:async", "level": "full"}),
                EventOrigin::System,
            )
            .await
            .unwrap();
        let entry = &results[0]["events"][0];
        assert_eq!(entry["params"][0]["name"], "prompt");
        assert_eq!(entry["emits"][0], "completion:result");
    }

    #[tokio::test]
    async fn test_help_for_unknown_event() {
        let (handle, _dir) = fixture().await;
        let err = handle
            .submit(
                EventName::parse("system:help").unwrap(),
                json!({"event": "missing:event"}),
                EventOrigin::System,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ksi_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_help_lists_usage() {
        let (handle, _dir) = fixture().await;
        let results = handle
            .submit(
                EventName::parse("system:help").unwrap(),
                json!({"event": "completion:async"}),
                EventOrigin::System,
            )
            .await
            .unwrap();
        assert_eq!(results[0]["event"], "completion:async");
        assert!(results[0]["usage"][0].as_str().unwrap().contains("prompt"));
    }
}
