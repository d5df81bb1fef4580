//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::agent::AgentKind;
use crate::{AppError, Result};

/// Default directory holding the metadata database and event files.
pub const DEFAULT_STORE_DIR: &str = ".agent-store";

/// How to launch one agent kind.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentCommand {
    /// Executable name or path.
    pub command: String,
    /// Arguments passed before any protocol traffic.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Configurable timeout values (seconds) for process lifecycle steps.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct TimeoutConfig {
    /// Maximum time for spawn plus the ACP `initialize` handshake.
    pub startup_seconds: u64,
    /// Grace period between closing stdin and force-killing the child.
    pub shutdown_grace_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            startup_seconds: 30,
            shutdown_grace_seconds: 5,
        }
    }
}

/// Global configuration parsed from `config.toml`.
///
/// Every field has a default so a missing config file yields a working
/// supervisor rooted at [`DEFAULT_STORE_DIR`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct GlobalConfig {
    /// Directory holding `switchboard.db` and `events/*.jsonl`.
    pub store_dir: PathBuf,
    /// Per-kind launch overrides; kinds not listed use built-in defaults.
    pub agents: HashMap<AgentKind, AgentCommand>,
    /// Process lifecycle timeouts.
    pub timeouts: TimeoutConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            agents: HashMap::new(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the launch command for an agent kind.
    ///
    /// Falls back to the built-in default when the config has no override:
    /// `gemini --experimental-acp`, `claude-code-acp`, `codex-acp`.
    #[must_use]
    pub fn agent_command(&self, kind: AgentKind) -> AgentCommand {
        if let Some(cmd) = self.agents.get(&kind) {
            return cmd.clone();
        }
        match kind {
            AgentKind::Gemini => AgentCommand {
                command: "gemini".to_owned(),
                args: vec!["--experimental-acp".to_owned()],
            },
            AgentKind::ClaudeCode => AgentCommand {
                command: "claude-code-acp".to_owned(),
                args: Vec::new(),
            },
            AgentKind::Codex => AgentCommand {
                command: "codex-acp".to_owned(),
                args: Vec::new(),
            },
        }
    }

    /// Startup timeout as a [`Duration`].
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.startup_seconds)
    }

    /// Shutdown grace period as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.shutdown_grace_seconds)
    }

    /// Validate field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when a configured agent command is empty
    /// or a timeout is zero.
    fn validate(&self) -> Result<()> {
        for (kind, cmd) in &self.agents {
            if cmd.command.trim().is_empty() {
                return Err(AppError::Config(format!(
                    "agents.{kind}: command must not be empty"
                )));
            }
        }
        if self.timeouts.startup_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.startup_seconds must be positive".into(),
            ));
        }
        if self.timeouts.shutdown_grace_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.shutdown_grace_seconds must be positive".into(),
            ));
        }
        Ok(())
    }
}
