//! Typed payloads for the ACP methods this supervisor speaks.
//!
//! Field names follow the protocol's camelCase wire format. Responses are
//! parsed leniently — absent optional sections default rather than error —
//! because agents at different protocol revisions omit different fields.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::agent::AgentCapabilities;
use crate::models::approval::{ApprovalOption, ToolCallRef};
use crate::models::session::SessionModeState;

/// ACP protocol revision this supervisor negotiates.
pub const PROTOCOL_VERSION: u16 = 1;

/// Method the host calls to negotiate capabilities.
pub const INITIALIZE: &str = "initialize";
/// Method the host calls to create a session.
pub const SESSION_NEW: &str = "session/new";
/// Method the host calls to run one prompt turn.
pub const SESSION_PROMPT: &str = "session/prompt";
/// Notification the host sends to cancel the current turn.
pub const SESSION_CANCEL: &str = "session/cancel";
/// Method the host calls to switch session modes.
pub const SESSION_SET_MODE: &str = "session/set_mode";
/// Notification the agent streams during a prompt turn.
pub const SESSION_UPDATE: &str = "session/update";
/// Request the agent makes to gate a tool call on operator approval.
pub const SESSION_REQUEST_PERMISSION: &str = "session/request_permission";

/// Build the `initialize` request parameters.
///
/// The supervisor is a headless host: it advertises no file-system or
/// terminal capabilities, so agents route those needs through their own
/// tooling rather than back across the protocol.
#[must_use]
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": "agent-switchboard",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "clientCapabilities": {
            "fs": { "readTextFile": false, "writeTextFile": false },
            "terminal": false,
        },
    })
}

/// Result of the `initialize` handshake.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    /// Protocol revision the agent settled on.
    #[serde(default)]
    pub protocol_version: u16,
    /// Capabilities the agent declared.
    #[serde(default)]
    pub agent_capabilities: AgentCapabilities,
}

/// Result of `session/new`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    /// Agent-assigned session identifier.
    pub session_id: String,
    /// Mode state, when the agent supports modes.
    #[serde(default)]
    pub modes: Option<SessionModeState>,
    /// Agent configuration options, passed through verbatim.
    #[serde(default)]
    pub config_options: Option<Value>,
}

/// Result of `session/prompt`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    /// Why the turn ended (`end_turn`, `cancelled`, `max_tokens`, …).
    pub stop_reason: String,
}

/// One block of prompt content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text itself.
        text: String,
    },
    /// Reference to an out-of-band resource (attachment).
    ResourceLink {
        /// Resource URI.
        uri: String,
        /// Optional display name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

/// Parameters of an inbound `session/request_permission` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestParams {
    /// Session the gated tool call belongs to.
    pub session_id: String,
    /// Descriptor of the gated tool call.
    pub tool_call: ToolCallRef,
    /// Options the operator may choose from.
    #[serde(default)]
    pub options: Vec<ApprovalOption>,
}

/// Build the result object answering `session/request_permission` with a
/// selected option.
#[must_use]
pub fn permission_selected(option_id: &str) -> Value {
    json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
}

/// Build the result object answering `session/request_permission` after
/// the turn was cancelled or the request denied without a selection.
#[must_use]
pub fn permission_cancelled() -> Value {
    json!({ "outcome": { "outcome": "cancelled" } })
}
