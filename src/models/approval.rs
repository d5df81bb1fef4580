//! Approval request model for agent permission prompts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status for an approval request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting operator decision.
    Pending,
    /// Operator selected one of the allow options.
    Approved,
    /// Operator rejected the request.
    Rejected,
    /// Session terminated before a decision was made.
    Expired,
}

impl ApprovalStatus {
    /// Whether the approval has been resolved one way or another.
    #[must_use]
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// The tool call an approval request is gating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRef {
    /// Agent-assigned tool call identifier.
    pub tool_call_id: String,
    /// Human-readable title for the call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Tool category (read, edit, execute, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Raw tool input as reported by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<Value>,
}

/// One option the operator can choose when resolving an approval.
///
/// `kind` is an open string (`allow_once`, `allow_always`, `reject_once`,
/// `reject_always`, …) because agents grow new kinds faster than this
/// supervisor does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalOption {
    /// Agent-assigned option identifier; echoed back on approval.
    pub option_id: String,
    /// Human-readable option label.
    pub name: String,
    /// Option kind hint.
    pub kind: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An outstanding permission prompt from the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ApprovalRequest {
    /// Unique request identifier.
    pub id: String,
    /// Client the request arrived on.
    pub client_id: String,
    /// Session the gated tool call belongs to.
    pub session_id: String,
    /// Descriptor of the gated tool call.
    pub tool_call: ToolCallRef,
    /// Options offered by the agent.
    pub options: Vec<ApprovalOption>,
    /// Current lifecycle status.
    pub status: ApprovalStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Resolution timestamp, once resolved.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// Construct a new pending approval request with a generated id.
    #[must_use]
    pub fn new(
        client_id: String,
        session_id: String,
        tool_call: ToolCallRef,
        options: Vec<ApprovalOption>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_id,
            session_id,
            tool_call,
            options,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Decision delivered to the suspended ACP permission handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// The operator selected the option with this id.
    Selected {
        /// Chosen option identifier.
        option_id: String,
    },
    /// The request was denied, expired, or its session was cancelled.
    Cancelled,
}
