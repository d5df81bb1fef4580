//! Normalized agent event taxonomy and its on-disk envelope.
//!
//! Events are stored and streamed as `{type, clientId, sessionId,
//! timestamp, payload}`. In memory the payload is a tagged union over the
//! known event types; on disk the payload stays an open-ended JSON value so
//! that events written by a newer supervisor (or an agent speaking a newer
//! ACP revision) survive a round trip through an older one. A payload that
//! does not match its declared type — and any type this build does not know
//! — deserializes to [`EventPayload::Unknown`] without losing the raw JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Streaming text fragment from the agent (or a user-authored message).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePayload {
    /// Text content of this fragment.
    pub content: String,
    /// Set for user-authored messages; absent for agent output.
    #[serde(rename = "isUser", default, skip_serializing_if = "Option::is_none")]
    pub is_user: Option<bool>,
}

/// Tool invocation start or progress record.
///
/// Terminal-execution content (cwd, command, exit code, truncated output,
/// duration) arrives inside `content` and is passed through verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallPayload {
    /// Agent-assigned tool call identifier.
    #[serde(rename = "toolCallId")]
    pub tool_call_id: String,
    /// Human-readable title for the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Tool category (read, edit, execute, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Call status: `pending`, `in_progress`, `completed`, or `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Structured call content, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    /// Raw tool input as reported by the agent.
    #[serde(rename = "rawInput", default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
    /// Forward-compatible pass-through of unrecognized fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One entry in the agent's execution plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanEntry {
    /// What the agent intends to do.
    pub content: String,
    /// Relative priority label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Entry status label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// The agent's current execution plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanPayload {
    /// Plan entries in agent order.
    #[serde(default)]
    pub entries: Vec<PlanEntry>,
}

/// The agent switched session modes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModeChangePayload {
    /// The newly selected mode identifier.
    #[serde(rename = "currentModeId")]
    pub current_mode_id: String,
}

/// Context-window and token accounting update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsagePayload {
    /// Context tokens used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<u64>,
    /// Context window size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Cumulative input tokens.
    #[serde(rename = "inputTokens", default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    /// Cumulative output tokens.
    #[serde(rename = "outputTokens", default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    /// Cumulative total tokens.
    #[serde(rename = "totalTokens", default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    /// Tokens served from prompt cache reads.
    #[serde(
        rename = "cachedReadTokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cached_read_tokens: Option<u64>,
    /// Tokens written to the prompt cache.
    #[serde(
        rename = "cachedWriteTokens",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cached_write_tokens: Option<u64>,
    /// Accumulated cost in the agent's billing currency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Forward-compatible pass-through of unrecognized fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A prompt turn finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletePayload {
    /// ACP stop reason (`end_turn`, `cancelled`, `max_tokens`, …).
    #[serde(rename = "stopReason")]
    pub stop_reason: String,
}

/// Something went wrong on this session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    /// Human-readable error message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

/// Tagged union over the event taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// Agent reasoning fragment.
    Thinking(MessagePayload),
    /// Agent or user message fragment.
    Message(MessagePayload),
    /// Tool invocation started.
    ToolCall(ToolCallPayload),
    /// Tool invocation progressed or finished.
    ToolUpdate(ToolCallPayload),
    /// Execution plan snapshot.
    Plan(PlanPayload),
    /// Session mode changed.
    ModeChange(ModeChangePayload),
    /// Agent configuration options changed; passed through verbatim.
    ConfigUpdate(Value),
    /// Token usage update.
    UsageUpdate(UsagePayload),
    /// Available slash-command set changed; passed through verbatim.
    CommandsUpdate(Value),
    /// Prompt turn completed.
    Complete(CompletePayload),
    /// Session-level failure.
    Error(ErrorPayload),
    /// Event type this build does not know; raw JSON retained.
    Unknown {
        /// The unrecognized `type` tag.
        kind: String,
        /// The raw payload, untouched.
        payload: Value,
    },
}

impl EventPayload {
    /// The `type` tag written to disk and streamed to subscribers.
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Thinking(_) => "thinking",
            Self::Message(_) => "message",
            Self::ToolCall(_) => "tool-call",
            Self::ToolUpdate(_) => "tool-update",
            Self::Plan(_) => "plan",
            Self::ModeChange(_) => "mode-change",
            Self::ConfigUpdate(_) => "config-update",
            Self::UsageUpdate(_) => "usage-update",
            Self::CommandsUpdate(_) => "commands-update",
            Self::Complete(_) => "complete",
            Self::Error(_) => "error",
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// Reassemble a typed payload from its tag and raw JSON.
    ///
    /// A known tag whose payload fails to deserialize degrades to
    /// [`EventPayload::Unknown`] rather than erroring, so a corrupt or
    /// future-shaped payload never blocks reading the rest of a log.
    #[must_use]
    pub fn from_parts(kind: &str, payload: Value) -> Self {
        fn typed<T, F>(payload: &Value, wrap: F) -> Option<EventPayload>
        where
            T: serde::de::DeserializeOwned,
            F: FnOnce(T) -> EventPayload,
        {
            serde_json::from_value(payload.clone()).ok().map(wrap)
        }

        let parsed = match kind {
            "thinking" => typed(&payload, Self::Thinking),
            "message" => typed(&payload, Self::Message),
            "tool-call" => typed(&payload, Self::ToolCall),
            "tool-update" => typed(&payload, Self::ToolUpdate),
            "plan" => typed(&payload, Self::Plan),
            "mode-change" => typed(&payload, Self::ModeChange),
            "config-update" => Some(Self::ConfigUpdate(payload.clone())),
            "usage-update" => typed(&payload, Self::UsageUpdate),
            "commands-update" => Some(Self::CommandsUpdate(payload.clone())),
            "complete" => typed(&payload, Self::Complete),
            "error" => typed(&payload, Self::Error),
            _ => None,
        };

        parsed.unwrap_or(Self::Unknown {
            kind: kind.to_owned(),
            payload,
        })
    }

    /// Serialize the payload back to its raw JSON form.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Thinking(p) | Self::Message(p) => to_json(p),
            Self::ToolCall(p) | Self::ToolUpdate(p) => to_json(p),
            Self::Plan(p) => to_json(p),
            Self::ModeChange(p) => to_json(p),
            Self::UsageUpdate(p) => to_json(p),
            Self::Complete(p) => to_json(p),
            Self::Error(p) => to_json(p),
            Self::ConfigUpdate(v) | Self::CommandsUpdate(v) => v.clone(),
            Self::Unknown { payload, .. } => payload.clone(),
        }
    }
}

/// Serialize a payload struct, degrading to `null` on the (unreachable for
/// these types) serializer failure path.
fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// On-disk and on-wire envelope for one event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    /// Event type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Owning client identifier.
    pub client_id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Event timestamp; non-decreasing within a session.
    pub timestamp: DateTime<Utc>,
    /// Raw payload JSON.
    pub payload: Value,
}

/// Normalized, append-only event record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(from = "RawEvent", into = "RawEvent")]
pub struct AgentEvent {
    /// Owning client identifier.
    pub client_id: String,
    /// Owning session identifier.
    pub session_id: String,
    /// Event timestamp; non-decreasing within a session.
    pub timestamp: DateTime<Utc>,
    /// Typed payload.
    pub payload: EventPayload,
}

impl AgentEvent {
    /// Construct an event stamped with the current time.
    #[must_use]
    pub fn new(client_id: &str, session_id: &str, payload: EventPayload) -> Self {
        Self {
            client_id: client_id.to_owned(),
            session_id: session_id.to_owned(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// The event's `type` tag.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.payload.type_name()
    }
}

impl From<RawEvent> for AgentEvent {
    fn from(raw: RawEvent) -> Self {
        Self {
            client_id: raw.client_id,
            session_id: raw.session_id,
            timestamp: raw.timestamp,
            payload: EventPayload::from_parts(&raw.kind, raw.payload),
        }
    }
}

impl From<AgentEvent> for RawEvent {
    fn from(event: AgentEvent) -> Self {
        Self {
            kind: event.payload.type_name().to_owned(),
            client_id: event.client_id,
            session_id: event.session_id,
            timestamp: event.timestamp,
            payload: event.payload.to_value(),
        }
    }
}
