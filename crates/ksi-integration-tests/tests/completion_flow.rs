//! End-to-end completion scenarios over a real socket: new
//! conversations, per-session serialization, cancellation.

use std::time::Duration;

use ksi_integration_tests::{ECHO_PROFILE, TestDaemon};
use ksi_provider::MockScript;
use serde_json::json;

async fn spawn_agent(client: &mut ksi_transport::TransportClient) -> String {
    let spawn = client
        .request("agent:spawn", json!({"component": "echo"}))
        .await
        .expect("agent:spawn");
    spawn["agent_id"].as_str().expect("agent_id").to_owned()
}

#[tokio::test]
async fn test_s1_new_conversation_adopts_provider_session() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;
    let agent_id = spawn_agent(&mut client).await;

    client
        .request("monitor:subscribe", json!({"patterns": ["completion:*"]}))
        .await
        .expect("subscribe");

    let reply = client
        .request(
            "completion:async",
            json!({"agent_id": agent_id, "prompt": "Hello", "model": "m"}),
        )
        .await
        .expect("completion:async");
    assert_eq!(reply["status"], "queued");
    let request_id = reply["request_id"].as_str().expect("request_id").to_owned();

    let result = client
        .wait_for_event("completion:result", Duration::from_secs(10))
        .await
        .expect("completion:result frame");
    assert_eq!(result["data"]["request_id"], request_id.as_str());
    let session = result["data"]["session_id"].as_str().expect("session_id").to_owned();
    assert!(session.starts_with("mock-sess-"));
    assert!(result["data"].get("usage").is_some());

    // The agent's current session pointer followed the minted id.
    let agent = client
        .request("agent:get", json!({"agent_id": agent_id}))
        .await
        .expect("agent:get");
    assert_eq!(agent["current_session"], session.as_str());
}

#[tokio::test]
async fn test_s2_continuation_serializes_and_tracks_newest_session() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;
    let agent_id = spawn_agent(&mut client).await;
    client
        .request("monitor:subscribe", json!({"patterns": ["completion:result"]}))
        .await
        .expect("subscribe");

    // Establish the conversation.
    client
        .request("completion:async", json!({"agent_id": agent_id, "prompt": "Hello"}))
        .await
        .expect("first request");
    client
        .wait_for_event("completion:result", Duration::from_secs(10))
        .await
        .expect("first result");

    // Two continuations; each provider turn mints a fresh session id.
    daemon.mock.push_script(MockScript::Succeed {
        text: "turn two".into(),
        new_session: true,
    });
    daemon.mock.push_script(MockScript::Succeed {
        text: "turn three".into(),
        new_session: true,
    });
    let second = client
        .request("completion:async", json!({"agent_id": agent_id, "prompt": "More"}))
        .await
        .expect("second request")["request_id"]
        .as_str()
        .expect("request_id")
        .to_owned();
    let third = client
        .request("completion:async", json!({"agent_id": agent_id, "prompt": "Even more"}))
        .await
        .expect("third request")["request_id"]
        .as_str()
        .expect("request_id")
        .to_owned();

    // Strict FIFO on the shared session: results arrive in submit order.
    let result_a = client
        .wait_for_event("completion:result", Duration::from_secs(10))
        .await
        .expect("second result");
    let result_b = client
        .wait_for_event("completion:result", Duration::from_secs(10))
        .await
        .expect("third result");
    assert_eq!(result_a["data"]["request_id"], second.as_str());
    assert_eq!(result_b["data"]["request_id"], third.as_str());

    // The newest minted id replaced the agent's pointer.
    let final_session = result_b["data"]["session_id"].as_str().expect("session").to_owned();
    let agent = client
        .request("agent:get", json!({"agent_id": agent_id}))
        .await
        .expect("agent:get");
    assert_eq!(agent["current_session"], final_session.as_str());
}

#[tokio::test]
async fn test_s3_cancellation_releases_the_session() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;
    let agent_id = spawn_agent(&mut client).await;
    client
        .request("monitor:subscribe", json!({"patterns": ["completion:*"]}))
        .await
        .expect("subscribe");

    // Establish a session first so the cancelled request holds its lock.
    client
        .request("completion:async", json!({"agent_id": agent_id, "prompt": "Hello"}))
        .await
        .expect("warm-up");
    client
        .wait_for_event("completion:result", Duration::from_secs(10))
        .await
        .expect("warm-up result");

    daemon.mock.push_script(MockScript::Hang);
    let request_id = client
        .request("completion:async", json!({"agent_id": agent_id, "prompt": "stuck"}))
        .await
        .expect("hanging request")["request_id"]
        .as_str()
        .expect("request_id")
        .to_owned();

    // The request reached the provider (progress arrived), so it is
    // active when the cancel lands.
    client
        .wait_for_event("completion:progress", Duration::from_secs(10))
        .await
        .expect("progress");

    client
        .request("completion:cancel", json!({"request_id": request_id}))
        .await
        .expect("cancel accepted");
    let cancelled = client
        .wait_for_event("completion:cancelled", Duration::from_secs(10))
        .await
        .expect("cancelled event");
    assert_eq!(cancelled["data"]["request_id"], request_id.as_str());

    // No result for the cancelled request...
    let stray = client
        .wait_for_event("completion:result", Duration::from_millis(400))
        .await;
    assert!(stray.is_err(), "cancelled request must not produce a result");

    // ...and the session lock is free: the next turn completes.
    client
        .request("completion:async", json!({"agent_id": agent_id, "prompt": "after"}))
        .await
        .expect("follow-up");
    client
        .wait_for_event("completion:result", Duration::from_secs(10))
        .await
        .expect("follow-up result");
}

#[tokio::test]
async fn test_duplicate_request_id_conflicts() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;
    let agent_id = spawn_agent(&mut client).await;

    client
        .request(
            "completion:async",
            json!({"agent_id": agent_id, "prompt": "one", "request_id": "req_dup"}),
        )
        .await
        .expect("first submit");
    let err = client
        .request(
            "completion:async",
            json!({"agent_id": agent_id, "prompt": "two", "request_id": "req_dup"}),
        )
        .await
        .expect_err("second submit must fail");
    assert_eq!(err.kind, ksi_core::ErrorKind::Conflict);
}

#[tokio::test]
async fn test_retry_then_success_on_transient_failure() {
    let daemon = TestDaemon::start(&[ECHO_PROFILE]).await;
    let mut client = daemon.client().await;
    let agent_id = spawn_agent(&mut client).await;
    client
        .request("monitor:subscribe", json!({"patterns": ["completion:result"]}))
        .await
        .expect("subscribe");

    // One transient failure, then success; backoff keeps it under a
    // couple of seconds with default retry settings.
    daemon
        .mock
        .push_script(MockScript::FailTransient("rate limited".into()));
    daemon.mock.push_script(MockScript::Succeed {
        text: "recovered".into(),
        new_session: true,
    });
    let request_id = client
        .request("completion:async", json!({"agent_id": agent_id, "prompt": "retry me"}))
        .await
        .expect("submit")["request_id"]
        .as_str()
        .expect("request_id")
        .to_owned();
    let result = client
        .wait_for_event("completion:result", Duration::from_secs(15))
        .await
        .expect("result after retry");
    assert_eq!(result["data"]["result"], "recovered");

    // The durable retry counter reflects both provider attempts.
    let record = daemon
        .handles
        .store
        .get_entity(&ksi_store::EntityRef::new("request", &request_id))
        .expect("read request")
        .expect("request exists");
    assert_eq!(record.properties["attempts"], 2);
}
