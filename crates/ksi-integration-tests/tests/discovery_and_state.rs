//! Introspection, shared state and composition surfaces over the socket.

use ksi_core::{AgentId, EventOrigin};
use ksi_integration_tests::{ECHO_PROFILE, TestDaemon};
use serde_json::json;

#[tokio::test]
async fn test_discover_lists_the_full_surface() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;

    let listing = client
        .request("system:discover", json!({}))
        .await
        .expect("system:discover");
    let events: Vec<&str> = listing["events"]
        .as_array()
        .expect("events")
        .iter()
        .filter_map(|e| e["event"].as_str())
        .collect();
    for expected in [
        "agent:spawn",
        "agent:terminate",
        "completion:async",
        "completion:cancel",
        "orchestration:start",
        "monitor:subscribe",
        "state:get",
        "system:discover",
        "system:help",
    ] {
        assert!(events.contains(&expected), "missing {expected}");
    }

    // Full level exposes the declared schema.
    let full = client
        .request(
            "system:discover",
            json!({"event": "completion:async", "level": "full"}),
        )
        .await
        .expect("full discover");
    let params = full["events"][0]["params"].as_array().expect("params");
    assert!(params.iter().any(|p| p["name"] == "prompt"));
}

#[tokio::test]
async fn test_help_describes_one_event() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;
    let help = client
        .request("system:help", json!({"event": "agent:spawn"}))
        .await
        .expect("system:help");
    assert_eq!(help["event"], "agent:spawn");
    assert!(help["usage"].as_array().expect("usage").len() > 1);
}

#[tokio::test]
async fn test_state_surface_round_trip() {
    let daemon = TestDaemon::start(&[]).await;
    let mut client = daemon.client().await;

    client
        .request(
            "state:set",
            json!({"namespace": "app", "key": "greeting", "value": {"text": "hello"}}),
        )
        .await
        .expect("state:set");
    let got = client
        .request("state:get", json!({"namespace": "app", "key": "greeting"}))
        .await
        .expect("state:get");
    assert_eq!(got["value"]["text"], "hello");

    client
        .request("state:set", json!({"namespace": "app", "key": "gadget", "value": 1}))
        .await
        .expect("state:set second");
    let listed = client
        .request("state:list", json!({"namespace": "app", "pattern": "g*"}))
        .await
        .expect("state:list");
    let keys = listed["keys"].as_array().expect("keys");
    assert_eq!(keys.len(), 2);

    let deleted = client
        .request("state:delete", json!({"namespace": "app", "key": "gadget"}))
        .await
        .expect("state:delete");
    assert_eq!(deleted["deleted"], true);

    let err = client
        .request("state:get", json!({"namespace": "app", "key": "gadget"}))
        .await
        .expect_err("deleted key must be gone");
    assert_eq!(err.kind, ksi_core::ErrorKind::NotFound);
}

#[tokio::test]
async fn test_state_write_is_capability_gated_for_agents() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;
    let agent_id = client
        .request("agent:spawn", json!({"component": "echo"}))
        .await
        .expect("spawn")["agent_id"]
        .as_str()
        .expect("agent_id")
        .to_owned();

    let err = daemon
        .handles
        .handle
        .submit(
            "state:set".parse().expect("name"),
            json!({"namespace": "app", "key": "k", "value": 1}),
            EventOrigin::Agent(AgentId::from(agent_id.as_str())),
        )
        .await
        .expect_err("agent without state_write must be rejected");
    assert_eq!(err.kind, ksi_core::ErrorKind::PermissionDenied);

    // Reads stay open.
    let err = daemon
        .handles
        .handle
        .submit(
            "state:get".parse().expect("name"),
            json!({"namespace": "app", "key": "missing"}),
            EventOrigin::Agent(AgentId::from(agent_id.as_str())),
        )
        .await
        .expect_err("missing key is not_found, not permission_denied");
    assert_eq!(err.kind, ksi_core::ErrorKind::NotFound);
}

#[tokio::test]
async fn test_composition_surface_and_round_trip() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;

    let listing = client
        .request("composition:list", json!({}))
        .await
        .expect("composition:list");
    assert_eq!(listing["total"], 1);

    // Round-trip identity: two resolutions across a reload serialize
    // identically.
    let first = client
        .request("composition:get", json!({"name": "echo"}))
        .await
        .expect("composition:get");
    client
        .request("composition:reload", json!({}))
        .await
        .expect("composition:reload");
    let second = client
        .request("composition:get", json!({"name": "echo"}))
        .await
        .expect("composition:get again");
    assert_eq!(first, second);

    // Indexing lands composition entities in the graph.
    let indexed = client
        .request("composition:rebuild_index", json!({}))
        .await
        .expect("rebuild_index");
    assert_eq!(indexed["indexed"], 1);
    let entity = daemon
        .handles
        .store
        .get_entity(&ksi_store::EntityRef::new("composition", "echo"))
        .expect("read")
        .expect("indexed entity");
    assert_eq!(entity.properties["component_type"], "profile");
}

#[tokio::test]
async fn test_system_health_reports() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;
    client
        .request("agent:spawn", json!({"component": "echo"}))
        .await
        .expect("spawn");
    let health = client
        .request("system:health", json!({}))
        .await
        .expect("system:health");
    assert_eq!(health["status"], "ok");
    assert_eq!(health["entities"]["agents"], 1);
}
