//! One supervised agent client: a child process, its transport, and the
//! ACP operations the supervisor performs against it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::acp::transport::{AcpTransport, Inbound};
use crate::acp::wire::{
    self, ContentBlock, InitializeResponse, NewSessionResponse, PromptResponse,
};
use crate::config::AgentCommand;
use crate::models::agent::{AgentCapabilities, AgentKind, ClientRecord, ClientStatus};
use crate::{AppError, Result};

/// Mutable client state behind one lock.
struct ClientState {
    status: ClientStatus,
    capabilities: Option<AgentCapabilities>,
    startup_error: Option<String>,
}

/// A stateful wrapper around one transport, exposing ACP operations at the
/// supervisor's abstraction level.
pub struct AgentClient {
    id: String,
    kind: AgentKind,
    cwd: PathBuf,
    created_at: DateTime<Utc>,
    transport: Arc<AcpTransport>,
    state: Mutex<ClientState>,
    /// Cancellation token per session with an outstanding prompt; fired on
    /// client shutdown so in-flight prompt calls resolve promptly.
    prompt_cancels: Mutex<HashMap<String, CancellationToken>>,
}

impl AgentClient {
    /// Spawn the agent child process for `kind` rooted at `cwd`.
    ///
    /// The returned client is in `Starting` status; callers must run
    /// [`Self::initialize`] before using it. The inbound receiver carries
    /// every agent-initiated frame and must be drained by a dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` when the executable cannot be launched;
    /// no client exists in that case.
    pub fn spawn(
        command: &AgentCommand,
        kind: AgentKind,
        cwd: PathBuf,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>)> {
        let id = Uuid::new_v4().to_string();
        let label = format!("{kind}:{id}");
        let (transport, inbound_rx) = AcpTransport::spawn_process(command, &cwd, &label)?;
        info!(client_id = %id, %kind, cwd = %cwd.display(), "agent process spawned");
        Ok((Self::wrap(id, kind, cwd, transport), inbound_rx))
    }

    /// Wrap an already-running transport (in-memory duplex in tests,
    /// pre-spawned processes in embedding code).
    #[must_use]
    pub fn from_transport(
        kind: AgentKind,
        cwd: PathBuf,
        transport: Arc<AcpTransport>,
    ) -> Arc<Self> {
        Self::wrap(Uuid::new_v4().to_string(), kind, cwd, transport)
    }

    fn wrap(id: String, kind: AgentKind, cwd: PathBuf, transport: Arc<AcpTransport>) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            cwd,
            created_at: Utc::now(),
            transport,
            state: Mutex::new(ClientState {
                status: ClientStatus::Starting,
                capabilities: None,
                startup_error: None,
            }),
            prompt_cancels: Mutex::new(HashMap::new()),
        })
    }

    /// Client identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Agent kind this client runs.
    #[must_use]
    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Canonical working directory the child is rooted at.
    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Snapshot the client as a [`ClientRecord`].
    pub async fn record(&self) -> ClientRecord {
        let state = self.state.lock().await;
        ClientRecord {
            id: self.id.clone(),
            kind: self.kind,
            cwd: self.cwd.clone(),
            status: state.status,
            capabilities: state.capabilities.clone(),
            startup_error: state.startup_error.clone(),
            created_at: self.created_at,
        }
    }

    /// Current lifecycle status.
    pub async fn status(&self) -> ClientStatus {
        self.state.lock().await.status
    }

    /// Whether the client is `Ready` and its transport is still pumping.
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.status == ClientStatus::Ready && self.transport.is_running()
    }

    /// Inbound frames the transport has delivered so far; see
    /// [`AcpTransport::delivered_seq`].
    #[must_use]
    pub fn delivered_seq(&self) -> u64 {
        self.transport.delivered_seq()
    }

    /// Perform the ACP `initialize` handshake.
    ///
    /// On success the client becomes `Ready` and its capabilities are
    /// recorded. On failure the client becomes `Error` and its transport is
    /// stopped; the record survives so operators can see what went wrong.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` on handshake timeout, `AppError::Acp` /
    /// `AppError::Protocol` on transport or agent failure.
    pub async fn initialize(&self, timeout: Duration) -> Result<AgentCapabilities> {
        let outcome = tokio::time::timeout(
            timeout,
            self.transport.request(wire::INITIALIZE, wire::initialize_params()),
        )
        .await
        .map_err(|_| {
            AppError::Spawn(format!(
                "agent did not answer initialize within {timeout:?}"
            ))
        })
        .and_then(|res| res)
        .and_then(|value| {
            serde_json::from_value::<InitializeResponse>(value)
                .map_err(|e| AppError::Acp(format!("invalid initialize response: {e}")))
        });

        match outcome {
            Ok(response) => {
                let mut state = self.state.lock().await;
                state.status = ClientStatus::Ready;
                state.capabilities = Some(response.agent_capabilities.clone());
                info!(
                    client_id = %self.id,
                    protocol_version = response.protocol_version,
                    "agent initialized"
                );
                Ok(response.agent_capabilities)
            }
            Err(err) => {
                {
                    let mut state = self.state.lock().await;
                    state.status = ClientStatus::Error;
                    state.startup_error = Some(err.to_string());
                }
                warn!(client_id = %self.id, error = %err, "initialize failed, stopping transport");
                self.transport.stop(Duration::from_secs(1)).await;
                Err(err)
            }
        }
    }

    /// Create a session on this client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` / `AppError::Protocol` when the call fails.
    pub async fn create_session(&self, cwd: Option<&Path>) -> Result<NewSessionResponse> {
        let cwd = cwd.unwrap_or(&self.cwd);
        let value = self
            .transport
            .request(
                wire::SESSION_NEW,
                json!({
                    "cwd": cwd.to_string_lossy(),
                    "mcpServers": [],
                }),
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|e| AppError::Acp(format!("invalid session/new response: {e}")))
    }

    /// Run one prompt turn and wait for its stop reason.
    ///
    /// Streaming `session/update` notifications arrive on the inbound
    /// channel while this call is outstanding. The call resolves when the
    /// agent answers — normally, after `session/cancel` with a cancelled
    /// stop reason, or with `AppError::Cancelled` when the client shuts
    /// down underneath it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` / `AppError::Protocol` / `AppError::Cancelled`.
    pub async fn prompt(
        &self,
        session_id: &str,
        blocks: Vec<ContentBlock>,
    ) -> Result<PromptResponse> {
        let cancel = CancellationToken::new();
        self.prompt_cancels
            .lock()
            .await
            .insert(session_id.to_owned(), cancel.clone());

        let outcome = self
            .transport
            .request_with_cancel(
                wire::SESSION_PROMPT,
                json!({ "sessionId": session_id, "prompt": blocks }),
                &cancel,
            )
            .await;

        self.prompt_cancels.lock().await.remove(session_id);

        let value = outcome?;
        serde_json::from_value(value)
            .map_err(|e| AppError::Acp(format!("invalid session/prompt response: {e}")))
    }

    /// Ask the agent to cancel the session's current turn.
    ///
    /// The outstanding `prompt` call, if any, resolves with a cancelled
    /// stop reason once the agent acknowledges.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` when the notification cannot be sent.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        self.transport
            .notify(wire::SESSION_CANCEL, json!({ "sessionId": session_id }))
            .await
    }

    /// Switch the session's mode.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp` / `AppError::Protocol` when the call fails.
    pub async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<()> {
        self.transport
            .request(
                wire::SESSION_SET_MODE,
                json!({ "sessionId": session_id, "modeId": mode_id }),
            )
            .await?;
        Ok(())
    }

    /// Record a status observed from outside (transport close, stop).
    pub async fn set_status(&self, status: ClientStatus, error: Option<String>) {
        let mut state = self.state.lock().await;
        state.status = status;
        if error.is_some() {
            state.startup_error = error;
        }
    }

    /// Stop the client: release in-flight prompts, then stop the
    /// transport, waiting up to `grace` for a voluntary child exit.
    ///
    /// Idempotent — stopping a stopped client does nothing.
    pub async fn stop(&self, grace: Duration) {
        {
            let mut state = self.state.lock().await;
            if state.status == ClientStatus::Stopped {
                debug!(client_id = %self.id, "client already stopped");
                return;
            }
            state.status = ClientStatus::Stopped;
        }

        let cancels: Vec<CancellationToken> =
            self.prompt_cancels.lock().await.drain().map(|(_, c)| c).collect();
        for cancel in cancels {
            cancel.cancel();
        }

        self.transport.stop(grace).await;
        info!(client_id = %self.id, "client stopped");
    }
}
