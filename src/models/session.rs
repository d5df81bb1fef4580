//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use super::agent::AgentKind;

/// Lifecycle status for an agent session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    /// Created and ready for the next prompt.
    Idle,
    /// Session creation against the agent is in flight.
    Starting,
    /// A prompt turn is executing.
    Running,
    /// Blocked on an operator approval decision.
    WaitingApproval,
    /// The last prompt turn finished normally.
    Completed,
    /// An unrecoverable failure occurred.
    Error,
    /// Owning client went away before the session finished.
    Killed,
}

impl SessionStatus {
    /// Whether this status is terminal. Terminal sessions accept no
    /// further prompts and never transition again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Killed)
    }
}

/// One mode the agent offers for a session (e.g. plan, code, ask).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionMode {
    /// Agent-assigned mode identifier.
    pub id: String,
    /// Human-readable mode name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Mode state returned by the agent on session creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionModeState {
    /// Currently selected mode, if the agent reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_mode_id: Option<String>,
    /// All modes the agent offers for this session.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_modes: Vec<SessionMode>,
}

/// Session domain entity persisted in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    /// ACP-assigned session identifier.
    pub id: String,
    /// Owning client identifier; the client may no longer exist.
    pub client_id: String,
    /// Agent kind, denormalized from the owning client.
    pub kind: AgentKind,
    /// Working directory the session operates in.
    pub cwd: PathBuf,
    /// Optional user-editable display name.
    pub name: Option<String>,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Modes the agent offers plus the selected one.
    pub modes: SessionModeState,
    /// Agent-reported configuration options, passed through verbatim.
    pub config_options: Option<Value>,
    /// Associated project, when the UI layer sets one.
    pub project_id: Option<String>,
    /// Associated worktree, when the UI layer sets one.
    pub worktree_id: Option<String>,
    /// Branch name denormalized from the worktree association.
    pub worktree_branch: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last metadata or event activity timestamp.
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Construct a new idle session owned by `client_id`.
    #[must_use]
    pub fn new(
        id: String,
        client_id: String,
        kind: AgentKind,
        cwd: PathBuf,
        modes: SessionModeState,
        config_options: Option<Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            client_id,
            kind,
            cwd,
            name: None,
            status: SessionStatus::Idle,
            modes,
            config_options,
            project_id: None,
            worktree_id: None,
            worktree_branch: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the session has reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Transitions out of a terminal status are never permitted; everything
    /// else is, which keeps the status monotone into `{completed, error,
    /// killed}`.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        !self.status.is_terminal() && self.status != next
    }
}
