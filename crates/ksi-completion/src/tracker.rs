//! The session/conversation tracker (the authority on session binding).
//!
//! # Locking
//!
//! Tracker operations on one session serialize behind a per-session
//! async mutex; the persisted lock in the session record is the
//! cross-restart truth. Waiters for a held lock queue FIFO and are woken
//! one at a time on release; a waiter that outlives the lock timeout
//! fails with `timeout`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use ksi_core::{AgentId, KsiError, KsiResult, RequestId, SessionId};
use ksi_store::{EntityRef, Store, StoreError, UpdateMode};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use crate::types::{RequestRecord, RequestStatus, SessionLock, SessionRecord};

const TYPE_REQUEST: &str = "request";
const TYPE_SESSION: &str = "session";
const TYPE_AGENT: &str = "agent";

fn request_ref(id: &RequestId) -> EntityRef {
    EntityRef::new(TYPE_REQUEST, id.as_str())
}

fn session_ref(id: &SessionId) -> EntityRef {
    EntityRef::new(TYPE_SESSION, id.as_str())
}

fn to_props<T: serde::Serialize>(value: &T) -> KsiResult<serde_json::Map<String, serde_json::Value>> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(KsiError::internal("record did not serialize to an object")),
    }
}

/// Tracks in-flight requests and binds provider-minted session ids.
pub struct SessionTracker {
    store: Arc<Store>,
    lock_timeout: Duration,
    /// Per-session op serialization.
    guards: DashMap<SessionId, Arc<Mutex<()>>>,
    /// FIFO of waiters per held session.
    waiters: DashMap<SessionId, VecDeque<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for SessionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTracker").finish_non_exhaustive()
    }
}

impl SessionTracker {
    /// Tracker over `store` with the configured lock timeout.
    #[must_use]
    pub fn new(store: Arc<Store>, lock_timeout: Duration) -> Self {
        Self {
            store,
            lock_timeout,
            guards: DashMap::new(),
            waiters: DashMap::new(),
        }
    }

    fn guard(&self, session: &SessionId) -> Arc<Mutex<()>> {
        self.guards
            .entry(session.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    /// Persist a freshly created request.
    ///
    /// # Errors
    ///
    /// Returns `conflict` when the request id is already tracked.
    pub fn track_request(&self, record: &RequestRecord) -> KsiResult<()> {
        match self
            .store
            .create_entity(&request_ref(&record.request_id), to_props(record)?)
        {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(_)) => Err(KsiError::conflict(format!(
                "request {} already submitted",
                record.request_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one request.
    ///
    /// # Errors
    ///
    /// Returns `not_found` for unknown requests.
    pub fn get_request(&self, request_id: &RequestId) -> KsiResult<RequestRecord> {
        let record = self
            .store
            .get_entity(&request_ref(request_id))
            .map_err(KsiError::from)?
            .ok_or_else(|| KsiError::not_found(format!("request {request_id}")))?;
        Ok(serde_json::from_value(serde_json::Value::Object(
            record.properties,
        ))?)
    }

    /// All tracked requests, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn list_requests(&self, status: Option<RequestStatus>) -> KsiResult<Vec<RequestRecord>> {
        Ok(self
            .scan_requests()?
            .into_iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .collect())
    }

    fn scan_requests(&self) -> KsiResult<Vec<RequestRecord>> {
        let mut out = Vec::new();
        for record in self.store.entities_of_type(TYPE_REQUEST)? {
            match serde_json::from_value::<RequestRecord>(serde_json::Value::Object(
                record.properties,
            )) {
                Ok(request) => out.push(request),
                Err(e) => warn!(error = %e, "skipping undecodable request record"),
            }
        }
        Ok(out)
    }

    /// Adopt a provider-returned session id for `request_id`.
    ///
    /// Binds the request's effective session, refreshes the session
    /// record, and moves the owning agent's current-session pointer — all
    /// under the session guard so no interleaving is observable.
    ///
    /// # Errors
    ///
    /// Returns `not_found` for unknown requests.
    pub async fn update_request_session(
        &self,
        request_id: &RequestId,
        new_session: &SessionId,
    ) -> KsiResult<()> {
        let guard = self.guard(new_session);
        let _held = guard.lock().await;

        let mut request = self.get_request(request_id)?;
        let previous = request.session_id.replace(new_session.clone());
        request.updated_at = Utc::now();
        self.store
            .update_entity(&request_ref(request_id), to_props(&request)?, UpdateMode::Replace)
            .map_err(KsiError::from)?;

        // Session record: create on first sight, refresh otherwise.
        let session_record = SessionRecord {
            session_id: new_session.clone(),
            agent_id: request.agent_id.clone(),
            last_activity: Utc::now(),
            lock: self.read_session(new_session)?.and_then(|s| s.lock),
        };
        self.write_session(&session_record)?;

        // The agent's current-session pointer always follows the newest
        // provider-minted id.
        if let Some(agent_id) = &request.agent_id {
            let agent = EntityRef::new(TYPE_AGENT, agent_id.as_str());
            let mut props = serde_json::Map::new();
            props.insert(
                "current_session".to_owned(),
                serde_json::Value::String(new_session.as_str().to_owned()),
            );
            match self.store.update_entity(&agent, props, UpdateMode::Merge) {
                Ok(_) | Err(StoreError::NotFound(_)) => {},
                Err(e) => return Err(e.into()),
            }
        }
        debug!(request = %request_id, session = %new_session, previous = ?previous, "session adopted");
        Ok(())
    }

    /// Move a request into a terminal (or active) state.
    ///
    /// # Errors
    ///
    /// Returns `not_found` for unknown requests.
    pub fn complete_request(
        &self,
        request_id: &RequestId,
        status: RequestStatus,
        failure: Option<String>,
        attempts: u32,
    ) -> KsiResult<RequestRecord> {
        let mut request = self.get_request(request_id)?;
        request.status = status;
        request.failure = failure;
        request.attempts = attempts;
        request.updated_at = Utc::now();
        self.store
            .update_entity(&request_ref(request_id), to_props(&request)?, UpdateMode::Replace)
            .map_err(KsiError::from)?;
        Ok(request)
    }

    /// The session an agent currently points at.
    ///
    /// # Errors
    ///
    /// Propagates store failures; an unknown agent yields `None`.
    pub fn get_agent_session(&self, agent_id: &AgentId) -> KsiResult<Option<SessionId>> {
        let agent = EntityRef::new(TYPE_AGENT, agent_id.as_str());
        Ok(self
            .store
            .get_entity(&agent)
            .map_err(KsiError::from)?
            .and_then(|record| {
                record
                    .properties
                    .get("current_session")
                    .and_then(|v| v.as_str())
                    .map(SessionId::from)
            }))
    }

    // -----------------------------------------------------------------------
    // Sessions and locks
    // -----------------------------------------------------------------------

    /// Read one session record.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn read_session(&self, session: &SessionId) -> KsiResult<Option<SessionRecord>> {
        Ok(self
            .store
            .get_entity(&session_ref(session))
            .map_err(KsiError::from)?
            .map(|record| serde_json::from_value(serde_json::Value::Object(record.properties)))
            .transpose()?)
    }

    fn write_session(&self, record: &SessionRecord) -> KsiResult<()> {
        let entity = session_ref(&record.session_id);
        let props = to_props(record)?;
        match self.store.update_entity(&entity, props.clone(), UpdateMode::Replace) {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound(_)) => {
                self.store.create_entity(&entity, props).map_err(KsiError::from)?;
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Acquire the session lock for `request`, waiting FIFO behind the
    /// current holder.
    ///
    /// # Errors
    ///
    /// Returns `timeout` when the lock cannot be had within the
    /// configured lock timeout.
    pub async fn acquire_lock(&self, session: &SessionId, request: &RequestId) -> KsiResult<()> {
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            // Fast path under the session guard.
            {
                let guard = self.guard(session);
                let _held = guard.lock().await;
                let now = Utc::now();
                let mut record = self.read_session(session)?.unwrap_or(SessionRecord {
                    session_id: session.clone(),
                    agent_id: None,
                    last_activity: now,
                    lock: None,
                });
                let free = match &record.lock {
                    None => true,
                    Some(lock) => lock.holder == *request || lock.expires_at <= now,
                };
                if free {
                    let expires_at = now
                        + chrono::Duration::from_std(self.lock_timeout)
                            .unwrap_or_else(|_| chrono::Duration::seconds(600));
                    record.lock = Some(SessionLock {
                        holder: request.clone(),
                        expires_at,
                    });
                    record.last_activity = now;
                    self.write_session(&record)?;
                    return Ok(());
                }
            }

            // Slow path: join the FIFO and wait for a release (or expiry).
            let (tx, rx) = oneshot::channel();
            self.waiters
                .entry(session.clone())
                .or_default()
                .push_back(tx);
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| {
                    KsiError::timeout(format!("session {session} lock wait timed out"))
                })?;
            // Re-check periodically so an expired-but-unreleased lock is
            // eventually stolen.
            let poll = remaining.min(Duration::from_millis(500));
            match tokio::time::timeout(poll, rx).await {
                Ok(_) | Err(_) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(KsiError::timeout(format!(
                            "session {session} lock wait timed out"
                        )));
                    }
                },
            }
        }
    }

    /// Release the session lock if `request` holds it, waking the next
    /// FIFO waiter.
    ///
    /// # Errors
    ///
    /// Propagates store failures. Releasing a lock held by someone else
    /// is a no-op (idempotent cleanup).
    pub async fn release_lock(&self, session: &SessionId, request: &RequestId) -> KsiResult<()> {
        {
            let guard = self.guard(session);
            let _held = guard.lock().await;
            if let Some(mut record) = self.read_session(session)? {
                if record.lock.as_ref().is_some_and(|l| l.holder == *request) {
                    record.lock = None;
                    record.last_activity = Utc::now();
                    self.write_session(&record)?;
                }
            }
        }
        if let Some(mut queue) = self.waiters.get_mut(session) {
            while let Some(waiter) = queue.pop_front() {
                if waiter.send(()).is_ok() {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Release every lock older than `grace` (restart sweep). Returns the
    /// sessions released.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn sweep_stale_locks(&self, grace: Duration) -> KsiResult<Vec<SessionId>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut released = Vec::new();
        for entity in self.store.entities_of_type(TYPE_SESSION)? {
            let Ok(mut record) = serde_json::from_value::<SessionRecord>(
                serde_json::Value::Object(entity.properties),
            ) else {
                continue;
            };
            if record.lock.as_ref().is_some_and(|l| l.expires_at <= cutoff) {
                record.lock = None;
                self.write_session(&record)?;
                released.push(record.session_id.clone());
            }
        }
        Ok(released)
    }

    /// Whether a session's lock is currently free (or expired).
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn lock_is_free(&self, session: &SessionId) -> KsiResult<bool> {
        Ok(match self.read_session(session)? {
            None => true,
            Some(record) => match record.lock {
                None => true,
                Some(lock) => lock.expires_at <= Utc::now(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> SessionTracker {
        SessionTracker::new(
            Arc::new(Store::in_memory().unwrap()),
            Duration::from_millis(300),
        )
    }

    fn record(id: &str, agent: Option<&str>, session: Option<&str>) -> RequestRecord {
        RequestRecord {
            request_id: RequestId::from(id),
            agent_id: agent.map(AgentId::from),
            session_id: session.map(SessionId::from),
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            attempts: 0,
            provider: "mock".to_owned(),
            model: "m".to_owned(),
            prompt: serde_json::json!("hi"),
            options: serde_json::Value::Null,
            failure: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_request_conflicts() {
        let tracker = tracker();
        tracker.track_request(&record("r1", None, None)).unwrap();
        let err = tracker.track_request(&record("r1", None, None)).unwrap_err();
        assert_eq!(err.kind, ksi_core::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_session_adoption_updates_agent_pointer() {
        let tracker = tracker();
        // The agent entity exists (the agent service creates it).
        tracker
            .store
            .create_entity(&EntityRef::new("agent", "a1"), serde_json::Map::new())
            .unwrap();
        tracker.track_request(&record("r1", Some("a1"), None)).unwrap();

        tracker
            .update_request_session(&RequestId::from("r1"), &SessionId::from("s-new"))
            .await
            .unwrap();

        let request = tracker.get_request(&RequestId::from("r1")).unwrap();
        assert_eq!(request.session_id, Some(SessionId::from("s-new")));
        assert_eq!(
            tracker.get_agent_session(&AgentId::from("a1")).unwrap(),
            Some(SessionId::from("s-new"))
        );
        assert!(tracker.read_session(&SessionId::from("s-new")).unwrap().is_some());

        // A later turn minting a new id replaces the pointer.
        tracker.track_request(&record("r2", Some("a1"), Some("s-new"))).unwrap();
        tracker
            .update_request_session(&RequestId::from("r2"), &SessionId::from("s-newer"))
            .await
            .unwrap();
        assert_eq!(
            tracker.get_agent_session(&AgentId::from("a1")).unwrap(),
            Some(SessionId::from("s-newer"))
        );
    }

    #[tokio::test]
    async fn test_lock_excludes_second_holder_until_release() {
        let tracker = Arc::new(tracker());
        let session = SessionId::from("s1");
        tracker
            .acquire_lock(&session, &RequestId::from("r1"))
            .await
            .unwrap();

        // Second acquire waits; release lets it through.
        let tracker2 = Arc::clone(&tracker);
        let session2 = session.clone();
        let waiter = tokio::spawn(async move {
            tracker2.acquire_lock(&session2, &RequestId::from("r2")).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        tracker.release_lock(&session, &RequestId::from("r1")).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lock_wait_times_out() {
        let tracker = tracker();
        let session = SessionId::from("s1");
        tracker.acquire_lock(&session, &RequestId::from("r1")).await.unwrap();
        // The same lock timeout bounds both holds and waits, so this
        // waiter may eventually steal the expired lock; a shorter wait
        // path must at least not return before the holder's expiry.
        let started = tokio::time::Instant::now();
        let outcome = tracker.acquire_lock(&session, &RequestId::from("r2")).await;
        assert!(started.elapsed() >= Duration::from_millis(250));
        // Either it stole the expired lock or timed out; both respect
        // the FIFO + expiry contract.
        if let Err(e) = outcome {
            assert_eq!(e.kind, ksi_core::ErrorKind::Timeout);
        }
    }

    #[tokio::test]
    async fn test_sweep_stale_locks() {
        let tracker = tracker();
        let session = SessionId::from("s1");
        tracker.acquire_lock(&session, &RequestId::from("r1")).await.unwrap();
        // Nothing is stale yet under a generous grace.
        assert!(tracker.sweep_stale_locks(Duration::from_secs(60)).unwrap().is_empty());
        // Wait past expiry, then sweep with zero grace.
        tokio::time::sleep(Duration::from_millis(350)).await;
        let released = tracker.sweep_stale_locks(Duration::ZERO).unwrap();
        assert_eq!(released, vec![session.clone()]);
        assert!(tracker.lock_is_free(&session).unwrap());
    }
}
