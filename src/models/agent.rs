//! Agent kind, client lifecycle, and agent capability models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// Supported agent binaries.
///
/// The kind governs which executable is launched and with what argv; the
/// ACP protocol surface is identical across kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// Google Gemini CLI in ACP mode.
    Gemini,
    /// Claude Code ACP adapter.
    ClaudeCode,
    /// OpenAI Codex ACP adapter.
    Codex,
}

impl AgentKind {
    /// Stable string form used in persistence and spawn-dedup keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::ClaudeCode => "claude-code",
            Self::Codex => "codex",
        }
    }

    /// Parse the stable string form back into the enum.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gemini" => Some(Self::Gemini),
            "claude-code" => Some(Self::ClaudeCode),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }
}

impl Display for AgentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status for a supervised client process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// Child spawned; ACP `initialize` handshake in flight.
    Starting,
    /// Handshake complete; accepting session operations.
    Ready,
    /// Unrecoverable startup or transport failure.
    Error,
    /// Stopped explicitly or child exited.
    Stopped,
}

/// Prompt content types the agent can accept.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PromptCapabilities {
    /// Whether image content blocks are accepted.
    #[serde(default)]
    pub image: bool,
    /// Whether audio content blocks are accepted.
    #[serde(default)]
    pub audio: bool,
    /// Whether embedded-context resource blocks are accepted.
    #[serde(default)]
    pub embedded_context: bool,
}

/// MCP transports the agent can connect to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct McpCapabilities {
    /// Streamable-HTTP MCP servers.
    #[serde(default)]
    pub http: bool,
    /// SSE MCP servers.
    #[serde(default)]
    pub sse: bool,
}

/// Capabilities declared by the agent during the `initialize` handshake.
///
/// Unknown capability fields are retained in `extra` so newer agents do not
/// lose information when round-tripped through the supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    /// Whether the agent can reload a previously persisted session.
    #[serde(default)]
    pub load_session: bool,
    /// Prompt content support.
    #[serde(default)]
    pub prompt_capabilities: PromptCapabilities,
    /// MCP transport support.
    #[serde(default)]
    pub mcp_capabilities: McpCapabilities,
    /// Forward-compatible pass-through of unrecognized capability fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Snapshot of one supervised client process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ClientRecord {
    /// Unique client identifier; immutable.
    pub id: String,
    /// Agent binary kind.
    pub kind: AgentKind,
    /// Canonicalized working directory the child is rooted at.
    pub cwd: PathBuf,
    /// Current lifecycle status.
    pub status: ClientStatus,
    /// Capabilities from the `initialize` handshake, once ready.
    pub capabilities: Option<AgentCapabilities>,
    /// Startup error message when status is `Error`.
    pub startup_error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}
