//! Subscriptions and their delivery queues.
//!
//! A subscription is a set of glob patterns over event names plus a scope
//! and a bounded delivery queue. The router posts matching events with
//! `try`-semantics: a full queue evicts its oldest entries rather than
//! ever blocking the dispatch loop, and the eviction count is surfaced so
//! the router can announce a `monitor:lag` event.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ksi_core::{AgentId, ClientId, Event, KsiError, KsiResult, OrchestrationId, SubscriberId};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// DeliveryQueue
// ---------------------------------------------------------------------------

/// Result of posting one event to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without loss.
    Queued,
    /// Queued after evicting this many oldest events.
    Dropped(usize),
    /// The subscriber's writer is gone; the subscription should be reaped.
    Closed,
}

/// Bounded FIFO that evicts its oldest entries instead of blocking.
#[derive(Debug)]
pub struct DeliveryQueue {
    inner: Mutex<VecDeque<Arc<Event>>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

impl DeliveryQueue {
    /// Queue bounded at `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Post an event, evicting the oldest entries on overflow.
    pub fn push(&self, event: Arc<Event>) -> PushOutcome {
        if self.closed.load(Ordering::SeqCst) {
            return PushOutcome::Closed;
        }
        let dropped = {
            let mut queue = self.inner.lock().expect("delivery queue lock poisoned");
            let mut dropped = 0;
            while queue.len() >= self.capacity {
                queue.pop_front();
                dropped += 1;
            }
            queue.push_back(event);
            dropped
        };
        self.notify.notify_one();
        if dropped == 0 {
            PushOutcome::Queued
        } else {
            PushOutcome::Dropped(dropped)
        }
    }

    /// Wait for the next event. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<Arc<Event>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.inner.lock().expect("delivery queue lock poisoned");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Mark the queue closed; wakes any waiting consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether [`DeliveryQueue::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Events currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("delivery queue lock poisoned").len()
    }

    /// Whether no events are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// What slice of the event stream a subscription sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// Everything.
    Global,
    /// Only events attributed to one agent.
    Agent(AgentId),
    /// Events inside one orchestration's subtree, down to `max_depth`
    /// relative levels (`-1` = unbounded).
    Subtree {
        /// Subtree root.
        orchestration_id: OrchestrationId,
        /// Relative depth bound.
        max_depth: i32,
    },
}

/// One registered interest in the event stream.
pub struct Subscription {
    /// Subscription id.
    pub id: SubscriberId,
    /// Owning client connection, when client-created.
    pub client_id: Option<ClientId>,
    /// Raw glob patterns as supplied.
    pub patterns: Vec<String>,
    compiled: GlobSet,
    /// Scope filter.
    pub scope: SubscriptionScope,
    /// Optional equality filters over top-level data fields.
    pub filters: Option<serde_json::Map<String, serde_json::Value>>,
    /// Delivery sink.
    pub queue: Arc<DeliveryQueue>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("patterns", &self.patterns)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Build a subscription from raw glob patterns.
    ///
    /// # Errors
    ///
    /// Returns `invalid_argument` for an uncompilable pattern or an empty
    /// pattern list.
    pub fn new(
        id: SubscriberId,
        client_id: Option<ClientId>,
        patterns: Vec<String>,
        scope: SubscriptionScope,
        filters: Option<serde_json::Map<String, serde_json::Value>>,
        queue: Arc<DeliveryQueue>,
    ) -> KsiResult<Self> {
        if patterns.is_empty() {
            return Err(KsiError::invalid_argument(
                "subscription needs at least one pattern",
            ));
        }
        let mut builder = GlobSetBuilder::new();
        for pattern in &patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                KsiError::invalid_argument(format!("bad pattern {pattern:?}: {e}"))
            })?;
            builder.add(glob);
        }
        let compiled = builder
            .build()
            .map_err(|e| KsiError::invalid_argument(e.to_string()))?;
        Ok(Self {
            id,
            client_id,
            patterns,
            compiled,
            scope,
            filters,
            queue,
        })
    }

    /// Whether the event name and data filters match (scope is checked by
    /// the router, which owns the orchestration index).
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if !self.compiled.is_match(event.name.as_str()) {
            return false;
        }
        if let Some(filters) = &self.filters {
            for (key, expected) in filters {
                if event.data.get(key) != Some(expected) {
                    return false;
                }
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Live subscriptions keyed by subscriber id.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subs: DashMap<SubscriberId, Arc<Subscription>>,
}

impl SubscriptionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a subscription.
    pub fn add(&self, subscription: Subscription) -> SubscriberId {
        let id = subscription.id.clone();
        self.subs.insert(id.clone(), Arc::new(subscription));
        id
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn remove(&self, id: &SubscriberId) -> bool {
        self.subs.remove(id).is_some()
    }

    /// Remove every subscription owned by a disconnecting client.
    pub fn remove_client(&self, client_id: &ClientId) -> usize {
        let doomed: Vec<SubscriberId> = self
            .subs
            .iter()
            .filter(|e| e.value().client_id.as_ref() == Some(client_id))
            .map(|e| e.key().clone())
            .collect();
        for id in &doomed {
            self.subs.remove(id);
        }
        doomed.len()
    }

    /// Snapshot all live subscriptions.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Subscription>> {
        self.subs.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Reap subscriptions whose queue has been closed.
    pub fn reap_closed(&self) -> usize {
        let doomed: Vec<SubscriberId> = self
            .subs
            .iter()
            .filter(|e| e.value().queue.is_closed())
            .map(|e| e.key().clone())
            .collect();
        for id in &doomed {
            self.subs.remove(id);
        }
        doomed.len()
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Whether no subscriptions exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}
