//! The completion service: queues, workers, retries, cancellation.
//!
//! # Queueing
//!
//! Every request lands on a FIFO keyed by its resolved session (requests
//! with no session yet are their own single-entry queue). Pushing onto an
//! idle queue activates it: the key goes to the worker pool's ready
//! channel. A worker drains one queue at a time, so one session is
//! strictly serial while distinct sessions run in parallel up to the
//! global / per-provider / per-model caps.
//!
//! # Safe suspension points
//!
//! Cancellation is observed before the provider call, inside it (the
//! driver kills its child), and across every backoff sleep. In every
//! path the session lock is released and exactly one terminal event is
//! emitted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use ksi_config::{CompletionSection, ProviderSection};
use ksi_core::{
    AgentId, Capability, Event, EventContext, EventName, KsiError, KsiResult, RequestId, SessionId,
};
use ksi_provider::{ProviderDriver, ProviderError, ProviderRequest};
use ksi_router::{
    CapabilityIndex, HandlerRegistry, HandlerSpec, ParamSpec, ParamType, RouterHandle,
};
use ksi_store::{EntityRef, Store};
use rand::Rng;
use serde_json::json;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tracker::SessionTracker;
use crate::types::{RequestRecord, RequestStatus};

// ---------------------------------------------------------------------------
// Queue plumbing
// ---------------------------------------------------------------------------

/// Key of one serialization domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum QueueKey {
    /// Requests continuing a known session.
    Session(SessionId),
    /// A request with no session yet serializes only with itself.
    Solo(RequestId),
}

struct QueueItem {
    request_id: RequestId,
    parent_ctx: EventContext,
}

#[derive(Default)]
struct SessionQueue {
    items: std::sync::Mutex<VecDeque<QueueItem>>,
    active: AtomicBool,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

struct Inner {
    store: Arc<Store>,
    tracker: Arc<SessionTracker>,
    drivers: HashMap<String, Arc<dyn ProviderDriver>>,
    config: CompletionSection,
    provider_defaults: ProviderSection,
    capabilities: Arc<CapabilityIndex>,
    router: RouterHandle,
    queues: DashMap<QueueKey, Arc<SessionQueue>>,
    cancels: DashMap<RequestId, CancellationToken>,
    global_slots: Arc<Semaphore>,
    provider_slots: DashMap<String, Arc<Semaphore>>,
    model_slots: DashMap<String, Arc<Semaphore>>,
    ready_tx: mpsc::UnboundedSender<QueueKey>,
    active_workers: AtomicUsize,
}

/// The completion service handle.
#[derive(Clone)]
pub struct CompletionService {
    inner: Arc<Inner>,
    ready_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueKey>>>,
}

impl std::fmt::Debug for CompletionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionService").finish_non_exhaustive()
    }
}

/// What restart recovery did.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RecoveryReport {
    /// Requests re-enqueued because their session lock was free.
    pub resurrected: Vec<RequestId>,
    /// Requests failed with `restart_abandoned`.
    pub abandoned: Vec<RequestId>,
    /// Sessions whose stale locks were released.
    pub locks_released: Vec<SessionId>,
}

impl CompletionService {
    /// Assemble the service.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        tracker: Arc<SessionTracker>,
        drivers: HashMap<String, Arc<dyn ProviderDriver>>,
        config: CompletionSection,
        provider_defaults: ProviderSection,
        capabilities: Arc<CapabilityIndex>,
        router: RouterHandle,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let global_slots = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            inner: Arc::new(Inner {
                store,
                tracker,
                drivers,
                config,
                provider_defaults,
                capabilities,
                router,
                queues: DashMap::new(),
                cancels: DashMap::new(),
                global_slots,
                provider_slots: DashMap::new(),
                model_slots: DashMap::new(),
                ready_tx,
                active_workers: AtomicUsize::new(0),
            }),
            ready_rx: Arc::new(tokio::sync::Mutex::new(ready_rx)),
        }
    }

    /// Spawn the worker pool.
    pub fn start_workers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.inner.config.workers)
            .map(|worker| {
                let service = self.clone();
                tokio::spawn(async move {
                    debug!(worker, "completion worker started");
                    loop {
                        let key = {
                            let mut rx = service.ready_rx.lock().await;
                            rx.recv().await
                        };
                        let Some(key) = key else { break };
                        service.inner.active_workers.fetch_add(1, Ordering::SeqCst);
                        service.inner.drain_queue(&key).await;
                        service.inner.active_workers.fetch_sub(1, Ordering::SeqCst);
                    }
                    debug!(worker, "completion worker stopped");
                })
            })
            .collect()
    }

    /// Register the `completion:*` and `conversation:active` handlers.
    pub fn register_handlers(&self, registry: &Arc<HandlerRegistry>) {
        let submit = self.inner.clone();
        registry.register_fn(
            HandlerSpec::new("completion:async", "Queue an LLM completion")
                .param(ParamSpec::optional("request_id", ParamType::String, "idempotency id"))
                .param(ParamSpec::optional("agent_id", ParamType::String, "agent the completion runs for"))
                .param(ParamSpec::optional("session_id", ParamType::String, "session to continue"))
                .param(ParamSpec::optional("provider", ParamType::String, "provider override"))
                .param(ParamSpec::optional("model", ParamType::String, "model override"))
                .param(ParamSpec::optional("prompt", ParamType::String, "prompt text"))
                .param(ParamSpec::optional("messages", ParamType::Array, "chat messages"))
                .param(ParamSpec::optional("options", ParamType::Object, "provider options"))
                .emits("completion:progress")
                .emits("completion:result")
                .emits("completion:error")
                .emits("completion:cancelled"),
            move |event: Event, _api| {
                let inner = Arc::clone(&submit);
                async move { inner.submit(&event).await }
            },
        );

        let cancel = self.inner.clone();
        registry.register_fn(
            HandlerSpec::new("completion:cancel", "Cancel an in-flight completion")
                .param(ParamSpec::required("request_id", ParamType::String, "request to cancel"))
                .emits("completion:cancelled"),
            move |event: Event, _api| {
                let inner = Arc::clone(&cancel);
                async move { inner.cancel(&event).await }
            },
        );

        let status = self.inner.clone();
        registry.register_fn(
            HandlerSpec::new("completion:status", "Queue and worker occupancy"),
            move |_event: Event, _api| {
                let inner = Arc::clone(&status);
                async move { inner.status() }
            },
        );

        let session_status = self.inner.clone();
        registry.register_fn(
            HandlerSpec::new("completion:session_status", "One session's queue state").param(
                ParamSpec::required("session_id", ParamType::String, "session to inspect"),
            ),
            move |event: Event, _api| {
                let inner = Arc::clone(&session_status);
                async move { inner.session_status(&event) }
            },
        );

        let active = self.inner.clone();
        registry.register_fn(
            HandlerSpec::new("conversation:active", "In-flight requests per session"),
            move |_event: Event, _api| {
                let inner = Arc::clone(&active);
                async move { inner.conversation_active() }
            },
        );
    }

    /// Restart recovery: sweep stale locks, resurrect pending requests
    /// whose session is free, abandon the rest.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn recover(&self, grace: Duration) -> KsiResult<RecoveryReport> {
        let mut report = RecoveryReport {
            locks_released: self.inner.tracker.sweep_stale_locks(grace)?,
            ..RecoveryReport::default()
        };

        // Decide every pending request's fate against the lock state as
        // it was at crash time, before abandoning actives releases their
        // locks — otherwise a request stuck behind a crashed holder
        // would wrongly resurrect.
        let requests = self.inner.tracker.list_requests(None)?;
        let mut resurrect = Vec::new();
        let mut abandon = Vec::new();
        for request in requests {
            match request.status {
                RequestStatus::Pending => {
                    let free = match &request.session_id {
                        None => true,
                        Some(session) => self.inner.tracker.lock_is_free(session)?,
                    };
                    if free {
                        resurrect.push(request);
                    } else {
                        abandon.push(request);
                    }
                },
                RequestStatus::Active => {
                    // In-flight at crash time; the provider call is gone.
                    abandon.push(request);
                },
                _ => {},
            }
        }
        for request in abandon {
            self.inner.abandon(&request).await;
            report.abandoned.push(request.request_id);
        }
        for request in resurrect {
            self.inner.enqueue(&request, &EventContext::root());
            report.resurrected.push(request.request_id);
        }
        info!(
            resurrected = report.resurrected.len(),
            abandoned = report.abandoned.len(),
            locks = report.locks_released.len(),
            "completion recovery finished"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

impl Inner {
    async fn submit(&self, event: &Event) -> KsiResult<serde_json::Value> {
        let data = &event.data;
        let prompt = data
            .get("prompt")
            .cloned()
            .or_else(|| data.get("messages").cloned())
            .ok_or_else(|| KsiError::invalid_argument("prompt or messages required"))?;

        let target_agent = data.get("agent_id").and_then(|v| v.as_str()).map(AgentId::from);

        // Agent callers may only run completions for themselves unless
        // they hold `completion.any`; the same capability covers targets
        // the graph does not know.
        let caller = event.context.agent_id.clone();
        if let Some(caller) = &caller {
            let foreign = target_agent.as_ref().is_some_and(|t| t != caller);
            let unknown = match &target_agent {
                Some(target) => self
                    .store
                    .get_entity(&EntityRef::new("agent", target.as_str()))
                    .map_err(KsiError::from)?
                    .is_none(),
                None => false,
            };
            if (foreign || unknown)
                && !self.capabilities.holds(caller, &Capability::completion_any())
            {
                return Err(KsiError::permission_denied(format!(
                    "agent {caller} needs completion.any to run completions for other agents"
                )));
            }
        }
        let agent_id = target_agent.or(caller);

        // Resolve the target session: explicit parameter, else the
        // agent's current pointer.
        let session_id = match data.get("session_id").and_then(|v| v.as_str()) {
            Some(session) => Some(SessionId::from(session)),
            None => match &agent_id {
                Some(agent) => self.tracker.get_agent_session(agent)?,
                None => None,
            },
        };

        let request_id = data
            .get("request_id")
            .and_then(|v| v.as_str())
            .map_or_else(RequestId::new, RequestId::from);
        let provider = data
            .get("provider")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.provider_defaults.default_provider)
            .to_owned();
        let model = data
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.provider_defaults.default_model)
            .to_owned();
        if !self.drivers.contains_key(&provider) {
            return Err(KsiError::invalid_argument(format!("unknown provider {provider:?}")));
        }

        let record = RequestRecord {
            request_id: request_id.clone(),
            agent_id,
            session_id,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            attempts: 0,
            provider,
            model,
            prompt,
            options: data.get("options").cloned().unwrap_or(serde_json::Value::Null),
            failure: None,
        };
        self.tracker.track_request(&record)?;
        self.enqueue(&record, &event.context);
        Ok(json!({"request_id": request_id, "status": "queued"}))
    }

    fn queue_key(record: &RequestRecord) -> QueueKey {
        match &record.session_id {
            Some(session) => QueueKey::Session(session.clone()),
            None => QueueKey::Solo(record.request_id.clone()),
        }
    }

    fn enqueue(&self, record: &RequestRecord, parent_ctx: &EventContext) {
        let key = Self::queue_key(record);
        self.cancels
            .insert(record.request_id.clone(), CancellationToken::new());
        let queue = self.queues.entry(key.clone()).or_default().clone();
        queue
            .items
            .lock()
            .expect("completion queue lock poisoned")
            .push_back(QueueItem {
                request_id: record.request_id.clone(),
                parent_ctx: parent_ctx.clone(),
            });
        if !queue.active.swap(true, Ordering::SeqCst) {
            let _ = self.ready_tx.send(key);
        }
    }

    // -----------------------------------------------------------------------
    // Worker side
    // -----------------------------------------------------------------------

    async fn drain_queue(&self, key: &QueueKey) {
        let Some(queue) = self.queues.get(key).map(|q| Arc::clone(&q)) else {
            return;
        };
        loop {
            let item = queue
                .items
                .lock()
                .expect("completion queue lock poisoned")
                .pop_front();
            match item {
                Some(item) => self.run_one(key, item).await,
                None => {
                    queue.active.store(false, Ordering::SeqCst);
                    // Re-check: a push may have raced the deactivation.
                    let refilled = !queue
                        .items
                        .lock()
                        .expect("completion queue lock poisoned")
                        .is_empty();
                    if refilled && !queue.active.swap(true, Ordering::SeqCst) {
                        let _ = self.ready_tx.send(key.clone());
                    }
                    break;
                },
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn run_one(&self, key: &QueueKey, item: QueueItem) {
        let request_id = item.request_id.clone();
        let ctx = item.parent_ctx;
        let cancel = self
            .cancels
            .get(&request_id)
            .map_or_else(CancellationToken::new, |t| t.value().clone());

        let record = match self.tracker.get_request(&request_id) {
            Ok(record) => record,
            Err(e) => {
                warn!(request = %request_id, error = %e, "queued request vanished");
                return;
            },
        };

        // Cancelled while still queued: terminal event, nothing ran.
        if cancel.is_cancelled() || record.status == RequestStatus::Cancelled {
            let _ = self
                .tracker
                .complete_request(&request_id, RequestStatus::Cancelled, None, record.attempts);
            self.emit(&ctx, "completion:cancelled", json!({"request_id": request_id}));
            self.cancels.remove(&request_id);
            return;
        }

        // Hold the session lock for the whole provider exchange.
        let locked_session = match key {
            QueueKey::Session(session) => {
                if let Err(e) = self.tracker.acquire_lock(session, &request_id).await {
                    let _ = self.tracker.complete_request(
                        &request_id,
                        RequestStatus::Failed,
                        Some("lock_timeout".to_owned()),
                        record.attempts,
                    );
                    self.emit(
                        &ctx,
                        "completion:error",
                        json!({
                            "request_id": request_id,
                            "kind": "timeout",
                            "message": e.message,
                            "retryable": true,
                        }),
                    );
                    self.cancels.remove(&request_id);
                    return;
                }
                Some(session.clone())
            },
            QueueKey::Solo(_) => None,
        };

        // Concurrency caps: global, then provider, then model.
        let _global = self
            .global_slots
            .clone()
            .acquire_owned()
            .await
            .expect("completion semaphore closed");
        let _provider_slot = match self.config.per_provider_max.get(&record.provider) {
            Some(&cap) => Some(self.slot(&self.provider_slots, &record.provider, cap).await),
            None => None,
        };
        let _model_slot = match self.config.per_model_max.get(&record.model) {
            Some(&cap) => Some(self.slot(&self.model_slots, &record.model, cap).await),
            None => None,
        };

        let _ = self
            .tracker
            .complete_request(&request_id, RequestStatus::Active, None, record.attempts);

        let (outcome, attempts) = self.attempt_with_retry(&record, &ctx, &cancel).await;

        match outcome {
            Ok(reply) => {
                if let Err(e) = self
                    .tracker
                    .update_request_session(&request_id, &reply.session_id)
                    .await
                {
                    warn!(request = %request_id, error = %e, "session adoption failed");
                }
                let _ = self.tracker.complete_request(
                    &request_id,
                    RequestStatus::Completed,
                    None,
                    attempts,
                );
                self.emit(
                    &ctx,
                    "completion:result",
                    json!({
                        "request_id": request_id,
                        "session_id": reply.session_id,
                        "result": reply.result,
                        "usage": reply.usage,
                    }),
                );
            },
            Err(ProviderError::Cancelled) => {
                let _ = self.tracker.complete_request(
                    &request_id,
                    RequestStatus::Cancelled,
                    None,
                    attempts,
                );
                self.emit(&ctx, "completion:cancelled", json!({"request_id": request_id}));
            },
            Err(e) => {
                let kind = e.kind();
                let _ = self.tracker.complete_request(
                    &request_id,
                    RequestStatus::Failed,
                    Some(kind.as_str().to_owned()),
                    attempts,
                );
                self.emit(
                    &ctx,
                    "completion:error",
                    json!({
                        "request_id": request_id,
                        "kind": kind,
                        "message": e.to_string(),
                        "retryable": false,
                    }),
                );
            },
        }

        if let Some(session) = locked_session {
            let _ = self.tracker.release_lock(&session, &request_id).await;
        }
        self.cancels.remove(&request_id);
    }

    /// Drive the provider with exponential backoff on retryable errors.
    ///
    /// Returns the terminal outcome together with the number of provider
    /// attempts actually made, which the caller persists on the request
    /// record.
    async fn attempt_with_retry(
        &self,
        record: &RequestRecord,
        ctx: &EventContext,
        cancel: &CancellationToken,
    ) -> (Result<ksi_provider::ProviderReply, ProviderError>, u32) {
        let Some(driver) = self.drivers.get(&record.provider).cloned() else {
            return (
                Err(ProviderError::Failed(format!(
                    "unknown provider {}",
                    record.provider
                ))),
                0,
            );
        };
        let timeout = Duration::from_secs(self.config.provider_timeout_secs);
        let retry = &self.config.retry;

        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return (Err(ProviderError::Cancelled), attempt - 1);
            }

            // Progress forwarding for this attempt.
            let (progress_tx, mut progress_rx) = mpsc::channel::<serde_json::Value>(32);
            let router = self.router.clone();
            let progress_ctx = ctx.clone();
            let request_id = record.request_id.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(update) = progress_rx.recv().await {
                    if let Ok(name) = EventName::parse("completion:progress") {
                        let mut data = json!({"request_id": request_id});
                        if let (Some(out), Some(update)) = (data.as_object_mut(), update.as_object())
                        {
                            for (k, v) in update {
                                out.insert(k.clone(), v.clone());
                            }
                        }
                        router.emit_from(name, data, &progress_ctx);
                    }
                }
            });

            let provider_request = ProviderRequest {
                provider: record.provider.clone(),
                model: record.model.clone(),
                prompt: record.prompt.clone(),
                session_id: record.session_id.clone(),
                options: record.options.clone(),
            };
            let run = driver.run(provider_request, progress_tx, cancel.clone());
            let outcome = match tokio::time::timeout(timeout, run).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Timeout(format!(
                    "provider {} exceeded {}s",
                    record.provider, self.config.provider_timeout_secs
                ))),
            };
            forwarder.abort();

            match outcome {
                Ok(reply) => return (Ok(reply), attempt),
                Err(ProviderError::Cancelled) => return (Err(ProviderError::Cancelled), attempt),
                Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
                    let backoff = backoff_delay(retry.base_delay_ms, retry.max_delay_ms, attempt);
                    debug!(
                        request = %record.request_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "retryable provider failure; backing off"
                    );
                    // Keep the durable retry counter honest even if we
                    // crash mid-backoff.
                    let _ = self.tracker.complete_request(
                        &record.request_id,
                        RequestStatus::Active,
                        None,
                        attempt,
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return (Err(ProviderError::Cancelled), attempt),
                        () = tokio::time::sleep(backoff) => {},
                    }
                },
                Err(e) => return (Err(e), attempt),
            }
        }
    }

    async fn slot(
        &self,
        slots: &DashMap<String, Arc<Semaphore>>,
        name: &str,
        cap: usize,
    ) -> tokio::sync::OwnedSemaphorePermit {
        let semaphore = slots
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(cap)))
            .value()
            .clone();
        semaphore
            .acquire_owned()
            .await
            .expect("completion semaphore closed")
    }

    // -----------------------------------------------------------------------
    // Cancel / status surfaces
    // -----------------------------------------------------------------------

    async fn cancel(&self, event: &Event) -> KsiResult<serde_json::Value> {
        let request_id = event
            .data
            .get("request_id")
            .and_then(|v| v.as_str())
            .map(RequestId::from)
            .ok_or_else(|| KsiError::invalid_argument("request_id required"))?;
        let record = self.tracker.get_request(&request_id)?;
        if record.status.is_terminal() {
            return Err(KsiError::conflict(format!(
                "request {request_id} already {status}",
                status = serde_json::to_string(&record.status).unwrap_or_default()
            )));
        }
        if let Some(token) = self.cancels.get(&request_id) {
            token.cancel();
        }
        Ok(json!({"request_id": request_id, "status": "cancelling"}))
    }

    fn status(&self) -> KsiResult<serde_json::Value> {
        let queued: usize = self
            .queues
            .iter()
            .map(|q| q.items.lock().expect("completion queue lock poisoned").len())
            .sum();
        let active_sessions = self
            .queues
            .iter()
            .filter(|q| q.active.load(Ordering::SeqCst))
            .count();
        Ok(json!({
            "queued": queued,
            "active_sessions": active_sessions,
            "busy_workers": self.active_workers.load(Ordering::SeqCst),
            "workers": self.config.workers,
            "global_slots_available": self.global_slots.available_permits(),
        }))
    }

    fn session_status(&self, event: &Event) -> KsiResult<serde_json::Value> {
        let session = event
            .data
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(SessionId::from)
            .ok_or_else(|| KsiError::invalid_argument("session_id required"))?;
        let record = self
            .tracker
            .read_session(&session)?
            .ok_or_else(|| KsiError::not_found(format!("session {session}")))?;
        let depth = self
            .queues
            .get(&QueueKey::Session(session.clone()))
            .map_or(0, |q| q.items.lock().expect("completion queue lock poisoned").len());
        Ok(json!({
            "session": record,
            "queued": depth,
        }))
    }

    fn conversation_active(&self) -> KsiResult<serde_json::Value> {
        let mut sessions: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
        for request in self.tracker.list_requests(None)? {
            if request.status.is_terminal() {
                continue;
            }
            let key = request
                .session_id
                .as_ref()
                .map_or_else(|| "(unbound)".to_owned(), |s| s.as_str().to_owned());
            sessions.entry(key).or_default().push(json!({
                "request_id": request.request_id,
                "agent_id": request.agent_id,
                "status": request.status,
            }));
        }
        Ok(json!({"sessions": sessions}))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn emit(&self, parent: &EventContext, name: &str, data: serde_json::Value) {
        if let Ok(name) = EventName::parse(name) {
            self.router.emit_from(name, data, parent);
        }
    }

    async fn abandon(&self, request: &RequestRecord) {
        let _ = self.tracker.complete_request(
            &request.request_id,
            RequestStatus::Failed,
            Some("restart_abandoned".to_owned()),
            request.attempts,
        );
        if let Some(session) = &request.session_id {
            let _ = self.tracker.release_lock(session, &request.request_id).await;
        }
        self.emit(
            &EventContext::root(),
            "completion:error",
            json!({
                "request_id": request.request_id,
                "kind": "restart_abandoned",
                "message": "daemon restarted while the request was in flight",
                "retryable": false,
            }),
        );
    }
}

fn backoff_delay(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1_u64 << attempt.min(16));
    let capped = exp.min(max_ms).max(1);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4);
    Duration::from_millis(capped.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = backoff_delay(100, 5_000, 1);
        assert!(first >= Duration::from_millis(200));
        let huge = backoff_delay(100, 5_000, 30);
        assert!(huge <= Duration::from_millis(5_000 + 5_000 / 4));
    }

    #[test]
    fn test_queue_key_partition() {
        let mut record = RequestRecord {
            request_id: RequestId::from("r1"),
            agent_id: None,
            session_id: None,
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            attempts: 0,
            provider: "mock".into(),
            model: "m".into(),
            prompt: json!("hi"),
            options: serde_json::Value::Null,
            failure: None,
        };
        assert_eq!(Inner::queue_key(&record), QueueKey::Solo(RequestId::from("r1")));
        record.session_id = Some(SessionId::from("s1"));
        assert_eq!(
            Inner::queue_key(&record),
            QueueKey::Session(SessionId::from("s1"))
        );
    }
}
