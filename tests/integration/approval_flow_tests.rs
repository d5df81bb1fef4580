//! Permission round-trips: the agent's `session/request_permission` parks
//! on the broker, the operator decides, and the suspended JSON-RPC handler
//! answers the agent.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use agent_switchboard::models::agent::AgentKind;
use agent_switchboard::models::approval::ApprovalStatus;
use agent_switchboard::models::session::SessionStatus;
use agent_switchboard::supervisor::client::AgentClient;
use agent_switchboard::AppError;

use super::test_helpers::{test_manager, wait_until, wire_transport};

fn permission_params() -> serde_json::Value {
    json!({
        "sessionId": "sess-1",
        "toolCall": {
            "toolCallId": "call-1",
            "title": "Write src/main.rs",
            "kind": "edit",
            "rawInput": { "path": "src/main.rs" },
        },
        "options": [
            { "optionId": "a", "name": "Allow", "kind": "allow_once" },
            { "optionId": "d", "name": "Deny", "kind": "reject_once" },
        ],
    })
}

/// Approving resolves the suspended handler with the chosen option and
/// the session goes `waiting-approval → running → completed`.
#[tokio::test]
async fn approve_round_trips_to_agent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(dir.path()).await;

    let (transport, inbound, mut agent) = wire_transport("fake");
    let client = AgentClient::from_transport(AgentKind::ClaudeCode, "/tmp/proj".into(), transport);

    let agent_task = tokio::spawn(async move {
        agent.handle_initialize().await;
        agent.handle_new_session("sess-1").await;

        let prompt = agent.expect_request("session/prompt").await;
        agent
            .request("perm-1", "session/request_permission", permission_params())
            .await;

        // Suspend until the operator decides.
        let decision = agent.recv().await;
        assert_eq!(decision["id"], "perm-1");
        assert_eq!(decision["result"]["outcome"]["outcome"], "selected");
        assert_eq!(decision["result"]["outcome"]["optionId"], "a");

        agent
            .respond(&prompt["id"], json!({ "stopReason": "end_turn" }))
            .await;
        agent
    });

    let record = manager.adopt_client(client, inbound).await.expect("adopt");
    manager
        .create_session(&record.id, None)
        .await
        .expect("create session");
    manager
        .send_message("sess-1", "please edit", &[])
        .await
        .expect("send");

    // The approval shows up and the session blocks on it.
    assert!(
        wait_until(
            || {
                let manager = Arc::clone(&manager);
                async move { manager.list_approvals().await.len() == 1 }
            },
            Duration::from_secs(1),
        )
        .await,
        "the permission request must be listed"
    );

    let pending = manager.list_approvals().await;
    let approval = &pending[0];
    assert_eq!(approval.session_id, "sess-1");
    assert_eq!(approval.tool_call.tool_call_id, "call-1");
    assert_eq!(approval.options.len(), 2);
    assert_eq!(
        manager.get_session("sess-1").await.expect("session").status,
        SessionStatus::WaitingApproval
    );

    let resolved = manager.approve(&approval.id, "a").await.expect("approve");
    assert_eq!(resolved.status, ApprovalStatus::Approved);

    // Approval unblocks the agent, which then finishes the turn.
    assert!(
        wait_until(
            || {
                let manager = Arc::clone(&manager);
                async move {
                    manager.get_session("sess-1").await.map(|s| s.status)
                        == Some(SessionStatus::Completed)
                }
            },
            Duration::from_secs(2),
        )
        .await,
        "session must complete after approval"
    );

    // Exactly-once: the broker has forgotten the id.
    assert!(matches!(
        manager.approve(&approval.id, "a").await,
        Err(AppError::AlreadyResolved(_))
    ));
    assert!(manager.list_approvals().await.is_empty());

    agent_task.await.expect("agent task");
}

/// Denying resolves the handler with a cancelled outcome.
#[tokio::test]
async fn deny_answers_cancelled_outcome() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(dir.path()).await;

    let (transport, inbound, mut agent) = wire_transport("fake");
    let client = AgentClient::from_transport(AgentKind::Gemini, "/tmp/proj".into(), transport);

    let agent_task = tokio::spawn(async move {
        agent.handle_initialize().await;
        agent.handle_new_session("sess-1").await;

        let prompt = agent.expect_request("session/prompt").await;
        agent
            .request("perm-1", "session/request_permission", permission_params())
            .await;

        let decision = agent.recv().await;
        assert_eq!(decision["result"]["outcome"]["outcome"], "cancelled");

        agent
            .respond(&prompt["id"], json!({ "stopReason": "refusal" }))
            .await;
        agent
    });

    let record = manager.adopt_client(client, inbound).await.expect("adopt");
    manager
        .create_session(&record.id, None)
        .await
        .expect("create session");
    manager
        .send_message("sess-1", "please edit", &[])
        .await
        .expect("send");

    assert!(
        wait_until(
            || {
                let manager = Arc::clone(&manager);
                async move { manager.list_approvals().await.len() == 1 }
            },
            Duration::from_secs(1),
        )
        .await
    );

    let approval_id = manager.list_approvals().await[0].id.clone();
    let resolved = manager.deny(&approval_id).await.expect("deny");
    assert_eq!(resolved.status, ApprovalStatus::Rejected);

    agent_task.await.expect("agent task");
}

/// Deleting a session auto-expires its pending approvals; the suspended
/// handler answers the agent with a cancelled outcome.
#[tokio::test]
async fn delete_session_expires_pending_approvals() {
    let dir = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(dir.path()).await;

    let (transport, inbound, mut agent) = wire_transport("fake");
    let client = AgentClient::from_transport(AgentKind::Codex, "/tmp/proj".into(), transport);

    let agent_task = tokio::spawn(async move {
        agent.handle_initialize().await;
        agent.handle_new_session("sess-1").await;

        let _prompt = agent.expect_request("session/prompt").await;
        agent
            .request("perm-1", "session/request_permission", permission_params())
            .await;

        let decision = agent.recv().await;
        assert_eq!(decision["id"], "perm-1");
        assert_eq!(decision["result"]["outcome"]["outcome"], "cancelled");
        agent
    });

    let record = manager.adopt_client(client, inbound).await.expect("adopt");
    manager
        .create_session(&record.id, None)
        .await
        .expect("create session");
    manager
        .send_message("sess-1", "edit away", &[])
        .await
        .expect("send");

    assert!(
        wait_until(
            || {
                let manager = Arc::clone(&manager);
                async move { manager.list_approvals().await.len() == 1 }
            },
            Duration::from_secs(1),
        )
        .await
    );

    manager.delete_session("sess-1").await.expect("delete");

    assert!(manager.list_approvals().await.is_empty());
    assert!(manager.get_session("sess-1").await.is_none());
    assert!(
        manager
            .get_session_events("sess-1", None)
            .await
            .expect("tail")
            .is_empty(),
        "deleted sessions have no readable history"
    );

    agent_task.await.expect("agent task");
}
