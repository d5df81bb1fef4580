//! Translation of raw ACP `session/update` notifications into the internal
//! event taxonomy.
//!
//! The mapping is fixed:
//!
//! | ACP variant                       | Internal event type |
//! |-----------------------------------|---------------------|
//! | `agent_thought_chunk`             | `thinking`          |
//! | `agent_message_chunk`             | `message`           |
//! | `user_message_chunk`              | `message` (isUser)  |
//! | `tool_call`                       | `tool-call`         |
//! | `tool_call_update`                | `tool-update`       |
//! | `plan`                            | `plan`              |
//! | `current_mode_update`             | `mode-change`       |
//! | `available_commands_update`       | `commands-update`   |
//! | `usage_update`                    | `usage-update`      |
//! | `available_config_options_update` | `config-update`     |
//!
//! Variants this build does not know become `unknown` events that retain
//! the raw JSON, so a newer agent never loses data through an older
//! supervisor.

use serde_json::{Map, Value};
use tracing::debug;

use crate::models::event::{EventPayload, MessagePayload};
use crate::{AppError, Result};

/// Normalize one `session/update` notification.
///
/// Returns the session id the update belongs to and the typed payload.
///
/// # Errors
///
/// Returns `AppError::Acp` when the notification lacks `sessionId` or the
/// `update.sessionUpdate` discriminator — without those the event cannot be
/// attributed, so it cannot be stored.
pub fn normalize_session_update(params: Value) -> Result<(String, EventPayload)> {
    let session_id = params
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Acp("session/update without sessionId".into()))?
        .to_owned();

    let update = params
        .get("update")
        .and_then(Value::as_object)
        .ok_or_else(|| AppError::Acp("session/update without update object".into()))?;

    let variant = update
        .get("sessionUpdate")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Acp("session/update without sessionUpdate tag".into()))?
        .to_owned();

    // Strip the discriminator; what remains is the variant payload.
    let mut rest: Map<String, Value> = update.clone();
    rest.remove("sessionUpdate");
    let rest = Value::Object(rest);

    let payload = match variant.as_str() {
        "agent_thought_chunk" => EventPayload::Thinking(chunk_message(&rest, None)),
        "agent_message_chunk" => EventPayload::Message(chunk_message(&rest, None)),
        "user_message_chunk" => EventPayload::Message(chunk_message(&rest, Some(true))),
        "tool_call" => EventPayload::from_parts("tool-call", rest),
        "tool_call_update" => EventPayload::from_parts("tool-update", rest),
        "plan" => EventPayload::from_parts("plan", rest),
        "current_mode_update" => EventPayload::from_parts("mode-change", rest),
        "available_commands_update" => EventPayload::CommandsUpdate(rest),
        "usage_update" => EventPayload::from_parts("usage-update", rest),
        "available_config_options_update" => EventPayload::ConfigUpdate(rest),
        other => {
            debug!(
                session_id = %session_id,
                variant = other,
                "unknown session/update variant, passing through"
            );
            EventPayload::Unknown {
                kind: other.to_owned(),
                payload: rest,
            }
        }
    };

    Ok((session_id, payload))
}

/// Build a message payload from a streaming chunk's content block.
fn chunk_message(rest: &Value, is_user: Option<bool>) -> MessagePayload {
    MessagePayload {
        content: content_text(rest.get("content")),
        is_user,
    }
}

/// Extract plain text from an ACP content block.
///
/// Text blocks yield their `text` field; bare strings pass through; any
/// other block kind is rendered as compact JSON so nothing is dropped.
fn content_text(content: Option<&Value>) -> String {
    match content {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(v) => v
            .get("text")
            .and_then(Value::as_str)
            .map_or_else(|| v.to_string(), str::to_owned),
    }
}
