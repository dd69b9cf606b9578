//! Restart semantics: stale-lock sweep, request resurrection and
//! abandonment, index rebuild, log replay.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ksi_completion::{RequestRecord, RequestStatus, SessionTracker};
use ksi_config::DaemonConfig;
use ksi_core::{AgentId, RequestId, SessionId};
use ksi_integration_tests::{ECHO_PROFILE, TestDaemon};
use ksi_router::{EventLog, LogEntry};
use ksi_store::{EntityRef, Store};
use serde_json::json;

fn request(id: &str, agent: Option<&str>, session: Option<&str>, status: RequestStatus) -> RequestRecord {
    RequestRecord {
        request_id: RequestId::from(id),
        agent_id: agent.map(AgentId::from),
        session_id: session.map(SessionId::from),
        status,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        attempts: 0,
        provider: "mock".to_owned(),
        model: "m".to_owned(),
        prompt: json!("hello"),
        options: serde_json::Value::Null,
        failure: None,
    }
}

/// Write the state a crashed daemon would leave behind: one live agent,
/// one request mid-flight holding its session lock, one pending request
/// stuck behind that lock, one pending request whose session is free.
async fn plant_crash_state(config: &DaemonConfig) {
    let store = Arc::new(Store::open(&config.store.path).expect("store"));
    // Long lock timeout: the crashed holder's lock must still look held
    // when the new daemon comes up.
    let tracker = SessionTracker::new(Arc::clone(&store), Duration::from_secs(300));

    for (id, state, sandbox) in [
        ("a1", "ready", "sbx_recovered"),
        // Caught mid-spawn by the crash; recovery must terminate it.
        ("a_mid_spawn", "spawning", "sbx_half_born"),
    ] {
        let mut agent_props = serde_json::Map::new();
        for (key, value) in [
            ("state", json!(state)),
            ("profile", json!("echo")),
            ("sandbox_id", json!(sandbox)),
            ("sandbox_path", json!(config.agents.sandbox_root.join(sandbox).display().to_string())),
            ("capabilities", json!([])),
            ("created_at", json!(Utc::now())),
        ] {
            agent_props.insert(key.to_owned(), value);
        }
        store
            .create_entity(&EntityRef::new("agent", id), agent_props)
            .expect("agent entity");
    }

    tracker
        .track_request(&request("req_active", Some("a1"), Some("s-held"), RequestStatus::Active))
        .expect("active request");
    tracker
        .acquire_lock(&SessionId::from("s-held"), &RequestId::from("req_active"))
        .await
        .expect("lock");

    tracker
        .track_request(&request("req_blocked", None, Some("s-held"), RequestStatus::Pending))
        .expect("blocked request");
    tracker
        .track_request(&request("req_free", None, Some("s-free"), RequestStatus::Pending))
        .expect("free request");
    // Arc drops here; the engine releases its file lock for the restart.
}

fn status_of(store: &Store, id: &str) -> (String, Option<String>) {
    let entity = store
        .get_entity(&EntityRef::new("request", id))
        .expect("read request")
        .expect("request exists");
    let status = entity
        .properties
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_owned();
    let failure = entity
        .properties
        .get("failure")
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    (status, failure)
}

#[tokio::test]
async fn test_s6_restart_abandons_held_and_resurrects_free() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let config = DaemonConfig::scoped_to(tempdir.path());
    plant_crash_state(&config).await;

    let daemon = TestDaemon::start_with(config, &[ECHO_PROFILE], None).await;
    let store = &daemon.handles.store;

    // The in-flight request and the one stuck behind its lock are gone.
    let (status, failure) = status_of(store, "req_active");
    assert_eq!(status, "failed");
    assert_eq!(failure.as_deref(), Some("restart_abandoned"));
    let (status, failure) = status_of(store, "req_blocked");
    assert_eq!(status, "failed");
    assert_eq!(failure.as_deref(), Some("restart_abandoned"));

    // The resurrected request runs to completion on the mock provider.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (status, _) = status_of(store, "req_free");
        if status == "completed" {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "resurrected request never completed (status {status})"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // The surviving agent was re-bound into the capability index and
    // answers on the public surface.
    assert!(daemon.handles.capabilities.get(&AgentId::from("a1")).is_some());
    let mut client = daemon.client().await;
    let list = client.request("agent:list", json!({})).await.expect("agent:list");
    let ids: Vec<&str> = list["agents"]
        .as_array()
        .expect("agents")
        .iter()
        .filter_map(|a| a["agent_id"].as_str())
        .collect();
    assert!(ids.contains(&"a1"));

    // The agent caught mid-spawn never went live.
    let half_born = client
        .request("agent:get", json!({"agent_id": "a_mid_spawn"}))
        .await
        .expect("agent:get mid-spawn");
    assert_eq!(half_born["state"], "terminated");
    assert!(
        daemon
            .handles
            .capabilities
            .get(&AgentId::from("a_mid_spawn"))
            .is_none()
    );

    drop(tempdir);
}

#[tokio::test]
async fn test_event_log_replays_in_append_order() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;
    for _ in 0..3 {
        client
            .request("system:health", json!({}))
            .await
            .expect("system:health");
    }

    let mut seqs = Vec::new();
    EventLog::replay(&daemon.handles.config.log.root, |entry| {
        if let LogEntry::Dispatch { seq, .. } = entry {
            seqs.push(seq);
        }
    })
    .expect("replay");

    assert!(seqs.len() >= 3);
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted, "dispatch lines must replay in append order");
}
