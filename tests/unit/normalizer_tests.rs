//! Unit tests for the ACP `session/update` → event taxonomy mapping.

use serde_json::json;

use agent_switchboard::models::event::EventPayload;
use agent_switchboard::normalizer::normalize_session_update;
use agent_switchboard::AppError;

fn update(variant: &str, fields: serde_json::Value) -> serde_json::Value {
    let mut update = fields;
    update["sessionUpdate"] = json!(variant);
    json!({ "sessionId": "sess-1", "update": update })
}

/// `agent_message_chunk` becomes a non-user `message` with the block text.
#[test]
fn agent_message_chunk_maps_to_message() {
    let params = update(
        "agent_message_chunk",
        json!({ "content": { "type": "text", "text": "Hello" } }),
    );
    let (session_id, payload) = normalize_session_update(params).expect("normalize");

    assert_eq!(session_id, "sess-1");
    match payload {
        EventPayload::Message(m) => {
            assert_eq!(m.content, "Hello");
            assert!(m.is_user.is_none(), "agent chunks carry no isUser flag");
        }
        other => panic!("expected message, got {other:?}"),
    }
}

/// `agent_thought_chunk` becomes `thinking`.
#[test]
fn thought_chunk_maps_to_thinking() {
    let params = update(
        "agent_thought_chunk",
        json!({ "content": { "type": "text", "text": "pondering" } }),
    );
    let (_, payload) = normalize_session_update(params).expect("normalize");
    assert!(matches!(payload, EventPayload::Thinking(m) if m.content == "pondering"));
}

/// `user_message_chunk` is a `message` flagged as user-authored.
#[test]
fn user_chunk_sets_is_user() {
    let params = update(
        "user_message_chunk",
        json!({ "content": { "type": "text", "text": "do it" } }),
    );
    let (_, payload) = normalize_session_update(params).expect("normalize");
    assert!(matches!(payload, EventPayload::Message(m) if m.is_user == Some(true)));
}

/// `tool_call` keeps its identifier and status.
#[test]
fn tool_call_maps_with_fields() {
    let params = update(
        "tool_call",
        json!({
            "toolCallId": "call-1",
            "title": "Read file",
            "kind": "read",
            "status": "in_progress"
        }),
    );
    let (_, payload) = normalize_session_update(params).expect("normalize");
    match payload {
        EventPayload::ToolCall(p) => {
            assert_eq!(p.tool_call_id, "call-1");
            assert_eq!(p.status.as_deref(), Some("in_progress"));
        }
        other => panic!("expected tool-call, got {other:?}"),
    }
}

/// `plan` carries its entries.
#[test]
fn plan_maps_with_entries() {
    let params = update(
        "plan",
        json!({
            "entries": [
                { "content": "write code", "priority": "high", "status": "pending" }
            ]
        }),
    );
    let (_, payload) = normalize_session_update(params).expect("normalize");
    match payload {
        EventPayload::Plan(p) => {
            assert_eq!(p.entries.len(), 1);
            assert_eq!(p.entries[0].content, "write code");
        }
        other => panic!("expected plan, got {other:?}"),
    }
}

/// `current_mode_update` becomes `mode-change`.
#[test]
fn mode_update_maps_to_mode_change() {
    let params = update("current_mode_update", json!({ "currentModeId": "plan" }));
    let (_, payload) = normalize_session_update(params).expect("normalize");
    assert!(matches!(
        payload,
        EventPayload::ModeChange(m) if m.current_mode_id == "plan"
    ));
}

/// `usage_update` keeps token accounting fields.
#[test]
fn usage_update_maps_with_tokens() {
    let params = update(
        "usage_update",
        json!({ "used": 1200, "size": 200_000, "outputTokens": 64, "cost": 0.25 })
    );
    let (_, payload) = normalize_session_update(params).expect("normalize");
    match payload {
        EventPayload::UsageUpdate(u) => {
            assert_eq!(u.used, Some(1_200));
            assert_eq!(u.size, Some(200_000));
            assert_eq!(u.output_tokens, Some(64));
        }
        other => panic!("expected usage-update, got {other:?}"),
    }
}

/// `available_commands_update` passes through as `commands-update`.
#[test]
fn commands_update_passes_through() {
    let params = update(
        "available_commands_update",
        json!({ "availableCommands": [{ "name": "test" }] }),
    );
    let (_, payload) = normalize_session_update(params).expect("normalize");
    match payload {
        EventPayload::CommandsUpdate(v) => {
            assert_eq!(v["availableCommands"][0]["name"], "test");
        }
        other => panic!("expected commands-update, got {other:?}"),
    }
}

/// A variant this build has never heard of becomes `unknown` and keeps
/// its raw payload.
#[test]
fn unknown_variant_passes_through() {
    let params = update("holographic_diff", json!({ "frames": 3 }));
    let (_, payload) = normalize_session_update(params).expect("normalize");
    match payload {
        EventPayload::Unknown { kind, payload } => {
            assert_eq!(kind, "holographic_diff");
            assert_eq!(payload["frames"], 3);
        }
        other => panic!("expected unknown, got {other:?}"),
    }
}

/// An update without a session id cannot be attributed and is an error.
#[test]
fn missing_session_id_errors() {
    let params = json!({ "update": { "sessionUpdate": "plan", "entries": [] } });
    assert!(matches!(
        normalize_session_update(params),
        Err(AppError::Acp(_))
    ));
}
