//! End-to-end session flows against a scripted fake agent: streamed-reply
//! coalescing, mode switching, prompt failure, and mid-prompt cancellation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agent_switchboard::models::agent::{AgentKind, ClientStatus};
use agent_switchboard::models::event::EventPayload;
use agent_switchboard::models::session::SessionStatus;
use agent_switchboard::supervisor::client::AgentClient;
use agent_switchboard::supervisor::SessionManager;

use super::test_helpers::{test_manager, wait_until, wire_transport};

async fn status_of(manager: &Arc<SessionManager>, session_id: &str) -> Option<SessionStatus> {
    manager.get_session(session_id).await.map(|s| s.status)
}

/// Streamed reply coalescing: the agent emits one chunk per character of
/// "Hello, world!"; the tail holds one merged `message` plus `complete`.
#[tokio::test]
async fn streamed_reply_coalesces_in_tail() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(dir.path()).await;

    let (transport, inbound, mut agent) = wire_transport("fake");
    let client = AgentClient::from_transport(AgentKind::ClaudeCode, "/tmp/proj".into(), transport);

    let agent_task = tokio::spawn(async move {
        agent.handle_initialize().await;
        agent.handle_new_session("sess-1").await;

        let prompt = agent.expect_request("session/prompt").await;
        assert_eq!(prompt["params"]["sessionId"], "sess-1");
        assert_eq!(prompt["params"]["prompt"][0]["type"], "text");
        agent.stream_message("sess-1", "Hello, world!").await;
        agent
            .respond(&prompt["id"], json!({ "stopReason": "end_turn" }))
            .await;
        agent
    });

    let record = manager
        .adopt_client(Arc::clone(&client), inbound)
        .await
        .expect("adopt");
    assert_eq!(record.status, ClientStatus::Ready);
    let capabilities = record.capabilities.expect("capabilities recorded");
    assert!(capabilities.prompt_capabilities.image);

    let session = manager
        .create_session(&record.id, None)
        .await
        .expect("create session");
    assert_eq!(session.id, "sess-1");
    assert_eq!(session.modes.current_mode_id.as_deref(), Some("code"));
    assert_eq!(session.status, SessionStatus::Idle);

    manager
        .send_message("sess-1", "say hello", &[])
        .await
        .expect("send");

    assert!(
        wait_until(
            || {
                let manager = Arc::clone(&manager);
                async move { status_of(&manager, "sess-1").await == Some(SessionStatus::Completed) }
            },
            Duration::from_secs(2),
        )
        .await,
        "session must complete"
    );

    let events = manager
        .get_session_events("sess-1", None)
        .await
        .expect("tail");
    assert_eq!(
        events.len(),
        3,
        "expected user message + merged reply + complete, got {events:?}"
    );

    match &events[0].payload {
        EventPayload::Message(m) => {
            assert_eq!(m.content, "say hello");
            assert_eq!(m.is_user, Some(true));
        }
        other => panic!("expected the synthetic user message first, got {other:?}"),
    }
    match &events[1].payload {
        EventPayload::Message(m) => {
            assert_eq!(m.content, "Hello, world!", "chunks must coalesce");
            assert!(m.is_user.is_none());
        }
        other => panic!("expected the merged agent reply, got {other:?}"),
    }
    match &events[2].payload {
        EventPayload::Complete(c) => assert_eq!(c.stop_reason, "end_turn"),
        other => panic!("expected complete last, got {other:?}"),
    }

    agent_task.await.expect("agent task");
}

/// Cancellation: `session/cancel` goes out, the agent answers the prompt
/// with a cancelled stop reason, and the session returns to `idle`.
#[tokio::test]
async fn cancel_returns_session_to_idle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(dir.path()).await;

    let (transport, inbound, mut agent) = wire_transport("fake");
    let client = AgentClient::from_transport(AgentKind::Gemini, "/tmp/proj".into(), transport);

    let agent_task = tokio::spawn(async move {
        agent.handle_initialize().await;
        agent.handle_new_session("sess-1").await;

        // The prompt call and the cancel notification race onto the wire
        // (the host enqueues the prompt from a background task), so accept
        // them in either order.
        let first = agent.recv().await;
        let second = agent.recv().await;
        let (prompt, cancel) = if first["method"] == "session/prompt" {
            (first, second)
        } else {
            (second, first)
        };
        assert_eq!(prompt["method"], "session/prompt");
        assert_eq!(cancel["method"], "session/cancel");
        assert_eq!(cancel["params"]["sessionId"], "sess-1");
        assert!(cancel.get("id").is_none(), "session/cancel is a notification");
        agent
            .respond(&prompt["id"], json!({ "stopReason": "cancelled" }))
            .await;
        agent
    });

    let record = manager
        .adopt_client(client, inbound)
        .await
        .expect("adopt");
    manager
        .create_session(&record.id, None)
        .await
        .expect("create session");
    manager
        .send_message("sess-1", "long task", &[])
        .await
        .expect("send");

    assert!(
        wait_until(
            || {
                let manager = Arc::clone(&manager);
                async move { status_of(&manager, "sess-1").await == Some(SessionStatus::Running) }
            },
            Duration::from_secs(1),
        )
        .await,
        "session must start running"
    );

    manager.cancel_session("sess-1").await.expect("cancel");

    assert!(
        wait_until(
            || {
                let manager = Arc::clone(&manager);
                async move { status_of(&manager, "sess-1").await == Some(SessionStatus::Idle) }
            },
            Duration::from_secs(1),
        )
        .await,
        "a cancelled turn must return the session to idle"
    );

    let events = manager
        .get_session_events("sess-1", None)
        .await
        .expect("tail");
    let last = events.last().expect("events exist");
    match &last.payload {
        EventPayload::Complete(c) => assert_eq!(c.stop_reason, "cancelled"),
        other => panic!("expected a cancelled complete event, got {other:?}"),
    }

    agent_task.await.expect("agent task");
}

/// `set_mode` round-trips through the agent, updates metadata, and appends
/// a `mode-change` event.
#[tokio::test]
async fn set_mode_updates_metadata_and_log() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(dir.path()).await;

    let (transport, inbound, mut agent) = wire_transport("fake");
    let client = AgentClient::from_transport(AgentKind::Codex, "/tmp/proj".into(), transport);

    let agent_task = tokio::spawn(async move {
        agent.handle_initialize().await;
        agent.handle_new_session("sess-1").await;

        let set_mode = agent.expect_request("session/set_mode").await;
        assert_eq!(set_mode["params"]["sessionId"], "sess-1");
        assert_eq!(set_mode["params"]["modeId"], "plan");
        agent.respond(&set_mode["id"], json!({})).await;
        agent
    });

    let record = manager.adopt_client(client, inbound).await.expect("adopt");
    manager
        .create_session(&record.id, None)
        .await
        .expect("create session");

    manager.set_mode("sess-1", "plan").await.expect("set mode");

    let session = manager.get_session("sess-1").await.expect("session");
    assert_eq!(session.modes.current_mode_id.as_deref(), Some("plan"));

    let events = manager
        .get_session_events("sess-1", None)
        .await
        .expect("tail");
    assert!(
        events.iter().any(|e| matches!(
            &e.payload,
            EventPayload::ModeChange(m) if m.current_mode_id == "plan"
        )),
        "mode-change event must be appended, got {events:?}"
    );

    agent_task.await.expect("agent task");
}

/// A JSON-RPC error answering the prompt surfaces as an `error` event and
/// flips the session to `error`; further prompts are refused.
#[tokio::test]
async fn prompt_error_terminates_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(dir.path()).await;

    let (transport, inbound, mut agent) = wire_transport("fake");
    let client = AgentClient::from_transport(AgentKind::ClaudeCode, "/tmp/proj".into(), transport);

    let agent_task = tokio::spawn(async move {
        agent.handle_initialize().await;
        agent.handle_new_session("sess-1").await;
        let prompt = agent.expect_request("session/prompt").await;
        agent
            .respond_error(&prompt["id"], -32000, "model exploded")
            .await;
        agent
    });

    let record = manager.adopt_client(client, inbound).await.expect("adopt");
    manager
        .create_session(&record.id, None)
        .await
        .expect("create session");
    manager
        .send_message("sess-1", "boom", &[])
        .await
        .expect("send");

    assert!(
        wait_until(
            || {
                let manager = Arc::clone(&manager);
                async move { status_of(&manager, "sess-1").await == Some(SessionStatus::Error) }
            },
            Duration::from_secs(2),
        )
        .await,
        "session must error"
    );

    let refused = manager.send_message("sess-1", "again", &[]).await;
    assert!(refused.is_err(), "terminal sessions accept no prompts");

    agent_task.await.expect("agent task");
}

/// When the agent closes its stream, owned non-terminal sessions flip to
/// `killed` and get an `error` event.
#[tokio::test]
async fn transport_close_kills_owned_sessions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(dir.path()).await;

    let (transport, inbound, mut agent) = wire_transport("fake");
    let client = AgentClient::from_transport(AgentKind::ClaudeCode, "/tmp/proj".into(), transport);

    let record = {
        let setup = tokio::spawn(async move {
            agent.handle_initialize().await;
            agent.handle_new_session("sess-1").await;
            agent
        });
        let record = manager
            .adopt_client(client, inbound)
            .await
            .expect("adopt");
        manager
            .create_session(&record.id, None)
            .await
            .expect("create session");
        // Hang up the agent side.
        drop(setup.await.expect("agent setup"));
        record
    };

    assert!(
        wait_until(
            || {
                let manager = Arc::clone(&manager);
                async move { status_of(&manager, "sess-1").await == Some(SessionStatus::Killed) }
            },
            Duration::from_secs(2),
        )
        .await,
        "sessions of a dead client must be killed"
    );

    let client_record = manager.get_client(&record.id).await.expect("client");
    assert_eq!(client_record.status, ClientStatus::Stopped);

    let events = manager
        .get_session_events("sess-1", None)
        .await
        .expect("tail");
    assert!(
        events
            .iter()
            .any(|e| matches!(&e.payload, EventPayload::Error(_))),
        "an error event must record the transport loss, got {events:?}"
    );
}
