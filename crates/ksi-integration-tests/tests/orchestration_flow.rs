//! Orchestrated subtrees: bubble-up levels, capability gating,
//! cascading termination.

use std::time::Duration;

use ksi_core::{AgentId, EventOrigin};
use ksi_integration_tests::{ECHO_PROFILE, TestDaemon};
use serde_json::json;

const PAIR_PATTERN: (&str, &str) = (
    "pair.yaml",
    r"name: pair
version: 1.0.0
component_type: pattern
agents:
  - name: c1
    profile: echo
    initial_prompt: report in
  - name: c2
    profile: echo
event_subscription_level: 1
error_subscription_level: -1
",
);

const QUIET_PATTERN: (&str, &str) = (
    "quiet.yaml",
    r"name: quiet
version: 1.0.0
component_type: pattern
agents:
  - name: c1
    profile: echo
    initial_prompt: report in
event_subscription_level: 0
error_subscription_level: 0
",
);

#[tokio::test]
async fn test_s4_level_one_bubbles_member_events() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE, PAIR_PATTERN]).await;
    let mut client = daemon.client().await;
    client
        .request("monitor:subscribe", json!({"patterns": ["orchestration:event"]}))
        .await
        .expect("subscribe");

    let started = client
        .request("orchestration:start", json!({"pattern": "pair"}))
        .await
        .expect("orchestration:start");
    let orch_id = started["orchestration_id"].as_str().expect("orch id").to_owned();
    assert_eq!(started["agents"].as_object().expect("agents").len(), 2);

    // c1's initial prompt drives a completion inside the subtree; with
    // level 1 its events reach the orchestrator.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("bubbled completion:result never arrived");
        let frame = client
            .wait_for_event("orchestration:event", remaining)
            .await
            .expect("orchestration:event");
        if frame["data"]["orchestration_id"] == orch_id.as_str()
            && frame["data"]["name"] == "completion:result"
        {
            break;
        }
    }
}

#[tokio::test]
async fn test_s4_level_zero_stays_quiet() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE, QUIET_PATTERN]).await;
    let mut client = daemon.client().await;
    client
        .request("monitor:subscribe", json!({"patterns": ["orchestration:event"]}))
        .await
        .expect("subscribe");

    let started = client
        .request("orchestration:start", json!({"pattern": "quiet"}))
        .await
        .expect("orchestration:start");
    let orch_id = started["orchestration_id"].as_str().expect("orch id").to_owned();

    // Member events sit one level below the orchestration; level 0
    // covers none of them.
    let mut saw_bubble = false;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
    while let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now()) {
        match client.wait_for_event("orchestration:event", remaining).await {
            Err(_) => break,
            Ok(frame) => {
                if frame["data"]["orchestration_id"] == orch_id.as_str() {
                    saw_bubble = true;
                }
            },
        }
    }
    assert!(!saw_bubble, "level 0 must not receive member events");
}

#[tokio::test]
async fn test_s5_capability_violation_rejects_agent_spawn() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;

    // An agent with no grants beyond its profile.
    let plain = client
        .request("agent:spawn", json!({"component": "echo"}))
        .await
        .expect("spawn plain agent")["agent_id"]
        .as_str()
        .expect("agent_id")
        .to_owned();

    let before = client
        .request("agent:list", json!({}))
        .await
        .expect("agent:list")["agents"]
        .as_array()
        .expect("agents")
        .len();

    let err = daemon
        .handles
        .handle
        .submit(
            "agent:spawn".parse().expect("name"),
            json!({"component": "echo"}),
            EventOrigin::Agent(AgentId::from(plain.as_str())),
        )
        .await
        .expect_err("spawn without spawn_agents must be rejected");
    assert_eq!(err.kind, ksi_core::ErrorKind::PermissionDenied);

    // No agent came into existence.
    let after = client
        .request("agent:list", json!({}))
        .await
        .expect("agent:list")["agents"]
        .as_array()
        .expect("agents")
        .len();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_granted_capability_opens_the_gate() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;

    // The client (trusted) grants spawn_agents at spawn time.
    let spawner = client
        .request(
            "agent:spawn",
            json!({"component": "echo", "capabilities": ["spawn_agents"]}),
        )
        .await
        .expect("spawn privileged agent")["agent_id"]
        .as_str()
        .expect("agent_id")
        .to_owned();

    let results = daemon
        .handles
        .handle
        .submit(
            "agent:spawn".parse().expect("name"),
            json!({"component": "echo"}),
            EventOrigin::Agent(AgentId::from(spawner.as_str())),
        )
        .await
        .expect("privileged agent may spawn");
    let child = results[0]["agent_id"].as_str().expect("child id");

    // The child hangs off its spawning parent in the graph.
    let list = client
        .request("agent:list", json!({}))
        .await
        .expect("agent:list");
    let ids: Vec<&str> = list["agents"]
        .as_array()
        .expect("agents")
        .iter()
        .filter_map(|a| a["agent_id"].as_str())
        .collect();
    assert!(ids.contains(&child));
}

#[tokio::test]
async fn test_cascading_termination_leaves_no_survivors() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE, PAIR_PATTERN]).await;
    let mut client = daemon.client().await;

    let started = client
        .request("orchestration:start", json!({"pattern": "pair"}))
        .await
        .expect("orchestration:start");
    let orch_id = started["orchestration_id"].as_str().expect("orch id").to_owned();
    let members: Vec<String> = started["agents"]
        .as_object()
        .expect("agents")
        .values()
        .filter_map(|v| v.as_str().map(str::to_owned))
        .collect();
    assert_eq!(members.len(), 2);

    let reply = client
        .request("orchestration:terminate", json!({"orchestration_id": orch_id}))
        .await
        .expect("terminate");
    assert_eq!(reply["state"], "terminated");

    // The orchestration entity is gone.
    let err = client
        .request("orchestration:status", json!({"orchestration_id": orch_id}))
        .await
        .expect_err("status after terminate");
    assert_eq!(err.kind, ksi_core::ErrorKind::NotFound);

    // Every member is terminated and none of their requests stay open.
    for member in &members {
        let agent = client
            .request("agent:get", json!({"agent_id": member}))
            .await
            .expect("agent:get");
        assert_eq!(agent["state"], "terminated");
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut open = 0;
        for entity in daemon
            .handles
            .store
            .entities_of_type("request")
            .expect("requests")
        {
            let agent = entity
                .properties
                .get("agent_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned();
            let status = entity
                .properties
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if members.iter().any(|m| m == &agent) && matches!(status, "pending" | "active") {
                open += 1;
            }
        }
        if open == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{open} member requests still open after cascade"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
