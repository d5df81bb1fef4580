//! Process-wide registry and orchestrator for clients and sessions.
//!
//! The [`SessionManager`] owns the client and session maps, routes UI-level
//! operations through the owning [`client::AgentClient`], runs one dispatch
//! loop per client transport (normalizing notifications into events and
//! parking permission requests on the approval broker), and keeps session
//! metadata, the event store, and live subscribers consistent.
//!
//! Its lifecycle is explicit: [`SessionManager::new`] at startup,
//! [`SessionManager::shutdown`] at teardown. Tests construct their own
//! instance pointed at a scratch directory; there are no hidden globals.

pub mod canonical;
pub mod client;
pub mod single_flight;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::acp::transport::{Inbound, Responder};
use crate::acp::wire::{self, ContentBlock, PermissionRequestParams};
use crate::broker::ApprovalBroker;
use crate::config::GlobalConfig;
use crate::hub::{EventHub, Subscription};
use crate::models::agent::{AgentKind, ClientRecord, ClientStatus};
use crate::models::approval::{ApprovalDecision, ApprovalRequest};
use crate::models::event::{
    AgentEvent, CompletePayload, ErrorPayload, EventPayload, MessagePayload,
};
use crate::models::session::{SessionRecord, SessionStatus};
use crate::normalizer::normalize_session_update;
use crate::persistence::store::{EventStore, MAX_SESSION_EVENTS};
use crate::{AppError, Result};

use client::AgentClient;
use single_flight::SingleFlight;

/// The process-wide supervisor registry.
pub struct SessionManager {
    config: GlobalConfig,
    store: Arc<EventStore>,
    hub: EventHub,
    broker: ApprovalBroker,
    clients: Mutex<HashMap<String, Arc<AgentClient>>>,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    spawns: SingleFlight<Result<String>>,
    /// Frames each client's dispatch loop has fully processed; used to
    /// order synthetic prompt-completion events after the streaming
    /// updates the agent sent first.
    dispatch_progress: Mutex<HashMap<String, watch::Receiver<u64>>>,
}

impl SessionManager {
    /// Open the store under `config.store_dir`, load session metadata, and
    /// sweep sessions orphaned by the previous run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` / `AppError::Io` when the store cannot be
    /// opened.
    pub async fn new(config: GlobalConfig) -> Result<Arc<Self>> {
        let hub = EventHub::new();
        let store = EventStore::open(&config.store_dir, hub.clone()).await?;
        Self::with_store(config, store, hub).await
    }

    /// Build a manager over an already-open store (tests use an in-memory
    /// database here).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` when loading session metadata fails.
    pub async fn with_store(
        config: GlobalConfig,
        store: Arc<EventStore>,
        hub: EventHub,
    ) -> Result<Arc<Self>> {
        let mut sessions = HashMap::new();
        for record in store.load_all_sessions().await? {
            sessions.insert(record.id.clone(), record);
        }

        let manager = Arc::new(Self {
            config,
            broker: ApprovalBroker::new(hub.clone()),
            hub,
            store,
            clients: Mutex::new(HashMap::new()),
            sessions: Mutex::new(sessions),
            spawns: SingleFlight::new(),
            dispatch_progress: Mutex::new(HashMap::new()),
        });

        let swept = manager.cleanup_stale().await;
        if swept > 0 {
            info!(swept, "killed sessions orphaned by previous run");
        }

        if let Some(mut failures) = manager.store.take_failures().await {
            let weak = Arc::downgrade(&manager);
            tokio::spawn(async move {
                while let Some(failure) = failures.recv().await {
                    let Some(manager) = weak.upgrade() else { break };
                    manager
                        .set_session_status(&failure.session_id, SessionStatus::Error)
                        .await;
                }
            });
        }

        Ok(manager)
    }

    // ── Client operations ────────────────────────────────────────────────

    /// Return the newest `ready` client for `(kind, cwd)` or spawn one.
    ///
    /// Concurrent calls for the same canonical key coalesce onto a single
    /// in-flight spawn; every caller observes the same client or error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` when the child cannot be launched,
    /// `AppError::Acp` / `AppError::Protocol` when `initialize` fails (the
    /// failed client stays listed with status `error`).
    pub async fn find_or_spawn_client(
        self: &Arc<Self>,
        kind: AgentKind,
        cwd: &str,
    ) -> Result<ClientRecord> {
        let canonical = canonical::canonicalize(cwd);
        if let Some(existing) = self.find_ready(kind, &canonical).await {
            debug!(client_id = %existing.id(), "reusing ready client");
            return Ok(existing.record().await);
        }

        let key = canonical::spawn_key(kind, &canonical);
        let manager = Arc::clone(self);
        let flight_cwd = canonical.clone();
        let client_id = self
            .spawns
            .run(&key, move || async move {
                // A racer may have finished the spawn while this caller was
                // contending for leadership.
                if let Some(existing) = manager.find_ready(kind, &flight_cwd).await {
                    return Ok(existing.id().to_owned());
                }
                manager.spawn_and_register(kind, flight_cwd).await
            })
            .await?;

        let client = self
            .client_arc(&client_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("client {client_id} vanished")))?;
        Ok(client.record().await)
    }

    /// Spawn a new client unconditionally, bypassing reuse.
    ///
    /// Coexists with [`Self::find_or_spawn_client`]: an explicit spawn adds
    /// a client and never invalidates an existing one; reuse prefers the
    /// newest ready client for the key.
    ///
    /// # Errors
    ///
    /// As [`Self::find_or_spawn_client`].
    pub async fn spawn_client(
        self: &Arc<Self>,
        kind: AgentKind,
        cwd: &str,
    ) -> Result<ClientRecord> {
        let canonical = canonical::canonicalize(cwd);
        let client_id = self.spawn_and_register(kind, canonical).await?;
        let client = self
            .client_arc(&client_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("client {client_id} vanished")))?;
        Ok(client.record().await)
    }

    /// Adopt an externally constructed client (tests drive in-memory
    /// transports through this; embedders can attach pre-spawned agents).
    ///
    /// Registers the client, starts its dispatch loop, and runs the
    /// `initialize` handshake.
    ///
    /// # Errors
    ///
    /// Returns the handshake error; the client stays listed with status
    /// `error`.
    pub async fn adopt_client(
        self: &Arc<Self>,
        client: Arc<AgentClient>,
        inbound_rx: mpsc::Receiver<Inbound>,
    ) -> Result<ClientRecord> {
        self.clients
            .lock()
            .await
            .insert(client.id().to_owned(), Arc::clone(&client));
        self.spawn_dispatch(Arc::clone(&client), inbound_rx).await;
        client.initialize(self.config.startup_timeout()).await?;
        Ok(client.record().await)
    }

    /// Gracefully stop a client and kill its non-terminal sessions.
    ///
    /// Idempotent — a second call on a stopped client is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown client id.
    pub async fn stop_client(&self, client_id: &str) -> Result<()> {
        let client = self
            .client_arc(client_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("client {client_id} not found")))?;
        client.stop(self.config.shutdown_grace()).await;
        self.kill_owned_sessions(client_id, None).await;
        Ok(())
    }

    /// All clients, newest first.
    pub async fn list_clients(&self) -> Vec<ClientRecord> {
        let clients: Vec<Arc<AgentClient>> = self.clients.lock().await.values().cloned().collect();
        let mut records = Vec::with_capacity(clients.len());
        for client in clients {
            records.push(client.record().await);
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// One client's record.
    pub async fn get_client(&self, client_id: &str) -> Option<ClientRecord> {
        let client = self.client_arc(client_id).await?;
        Some(client.record().await)
    }

    // ── Session operations ───────────────────────────────────────────────

    /// Create a session on a ready client.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown client,
    /// `AppError::Unavailable` when it is not ready, or the ACP error from
    /// `session/new`.
    pub async fn create_session(
        &self,
        client_id: &str,
        cwd: Option<&str>,
    ) -> Result<SessionRecord> {
        let client = self
            .client_arc(client_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("client {client_id} not found")))?;
        if !client.is_running().await {
            return Err(AppError::Unavailable(format!(
                "client {client_id} is not ready"
            )));
        }

        let cwd_path: Option<PathBuf> = cwd.map(canonical::canonicalize);
        let response = client.create_session(cwd_path.as_deref()).await?;

        let record = SessionRecord::new(
            response.session_id,
            client.id().to_owned(),
            client.kind(),
            cwd_path.unwrap_or_else(|| client.cwd().to_path_buf()),
            response.modes.unwrap_or_default(),
            response.config_options,
        );
        self.store.save_session(&record, &[]).await?;
        self.sessions
            .lock()
            .await
            .insert(record.id.clone(), record.clone());
        info!(session_id = %record.id, client_id, "session created");
        Ok(record)
    }

    /// Enqueue one prompt turn.
    ///
    /// Emits the synthetic user `message` event, flips the session to
    /// `running`, and returns; the turn itself completes in the background,
    /// appending `complete` (with the agent's stop reason) or `error` and
    /// settling the session status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session,
    /// `AppError::Unavailable` when the session is terminal or its client
    /// is gone.
    pub async fn send_message(
        self: &Arc<Self>,
        session_id: &str,
        text: &str,
        attachments: &[String],
    ) -> Result<()> {
        let session = self
            .get_session(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
        if session.status.is_terminal() {
            return Err(AppError::Unavailable(format!(
                "session {session_id} is terminal and accepts no prompts"
            )));
        }
        let client = self
            .client_arc(&session.client_id)
            .await
            .ok_or_else(|| AppError::Unavailable("owning client is gone".into()))?;
        if !client.is_running().await {
            return Err(AppError::Unavailable("owning client is not running".into()));
        }

        self.record_event(
            client.id(),
            session_id,
            EventPayload::Message(MessagePayload {
                content: text.to_owned(),
                is_user: Some(true),
            }),
        )
        .await;
        self.set_session_status(session_id, SessionStatus::Running)
            .await;

        let mut blocks = vec![ContentBlock::Text {
            text: text.to_owned(),
        }];
        blocks.extend(attachments.iter().map(|uri| ContentBlock::ResourceLink {
            uri: uri.clone(),
            name: None,
        }));

        let manager = Arc::clone(self);
        let sid = session_id.to_owned();
        tokio::spawn(async move {
            let outcome = client.prompt(&sid, blocks).await;
            manager.finish_prompt(&client, &sid, outcome).await;
        });
        Ok(())
    }

    /// Cancel the session's current prompt turn, if any.
    ///
    /// The agent answers the outstanding `prompt` call with a cancelled
    /// stop reason; no-op when nothing is running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn cancel_session(&self, session_id: &str) -> Result<()> {
        let session = self
            .get_session(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
        let Some(client) = self.client_arc(&session.client_id).await else {
            return Ok(());
        };
        if !client.is_running().await {
            return Ok(());
        }
        client.cancel(session_id).await
    }

    /// Delete a session: metadata, event file, coalesce buffer, and any
    /// unresolved approvals (auto-denied).
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session, or the store
    /// error when removal fails.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let expired = self.broker.expire_session(session_id).await;
        if !expired.is_empty() {
            debug!(
                session_id,
                count = expired.len(),
                "expired approvals of deleted session"
            );
        }
        // Remove from the registry first so in-flight tasks stop appending.
        let removed = self.sessions.lock().await.remove(session_id);
        if removed.is_none() {
            return Err(AppError::NotFound(format!(
                "session {session_id} not found"
            )));
        }
        self.store.delete_session(session_id).await?;
        info!(session_id, "session deleted");
        Ok(())
    }

    /// Rename a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn rename_session(&self, session_id: &str, name: Option<&str>) -> Result<()> {
        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(session_id).ok_or_else(|| {
                AppError::NotFound(format!("session {session_id} not found"))
            })?;
            session.name = name.map(str::to_owned);
            session.updated_at = Utc::now();
        }
        self.store.update_name(session_id, name).await
    }

    /// Switch a session's mode; on success updates metadata and appends a
    /// `mode-change` event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` / `AppError::Unavailable`, or the ACP
    /// error from `session/set_mode`.
    pub async fn set_mode(&self, session_id: &str, mode_id: &str) -> Result<()> {
        let session = self
            .get_session(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
        if session.status.is_terminal() {
            return Err(AppError::Unavailable(format!(
                "session {session_id} is terminal"
            )));
        }
        let client = self
            .client_arc(&session.client_id)
            .await
            .ok_or_else(|| AppError::Unavailable("owning client is gone".into()))?;

        client.set_mode(session_id, mode_id).await?;

        self.apply_mode_change(session_id, mode_id).await;
        self.record_event(
            client.id(),
            session_id,
            EventPayload::ModeChange(crate::models::event::ModeChangePayload {
                current_mode_id: mode_id.to_owned(),
            }),
        )
        .await;
        Ok(())
    }

    /// Associate a session with a project/worktree.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session.
    pub async fn set_project_context(
        &self,
        session_id: &str,
        project_id: Option<&str>,
        worktree_id: Option<&str>,
        worktree_branch: Option<&str>,
    ) -> Result<()> {
        {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(session_id).ok_or_else(|| {
                AppError::NotFound(format!("session {session_id} not found"))
            })?;
            session.project_id = project_id.map(str::to_owned);
            session.worktree_id = worktree_id.map(str::to_owned);
            session.worktree_branch = worktree_branch.map(str::to_owned);
            session.updated_at = Utc::now();
        }
        self.store
            .update_project_context(session_id, project_id, worktree_id, worktree_branch)
            .await
    }

    /// Re-attach a session whose owning client is gone: spawn (or reuse) a
    /// client for the same `(kind, cwd)`, point the session at it, and
    /// mark it active again. Historical events remain intact.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session, or the spawn
    /// error.
    pub async fn reconnect_session(self: &Arc<Self>, session_id: &str) -> Result<SessionRecord> {
        let session = self
            .get_session(session_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;

        if let Some(client) = self.client_arc(&session.client_id).await {
            if client.is_running().await {
                return Ok(session);
            }
        }

        let cwd = session.cwd.to_string_lossy().into_owned();
        let client_record = self.find_or_spawn_client(session.kind, &cwd).await?;

        let updated = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.get_mut(session_id).ok_or_else(|| {
                AppError::NotFound(format!("session {session_id} deleted during reconnect"))
            })?;
            session.client_id = client_record.id.clone();
            session.status = SessionStatus::Idle;
            session.updated_at = Utc::now();
            session.clone()
        };
        self.store.save_session(&updated, &[]).await?;
        info!(session_id, client_id = %client_record.id, "session reconnected");
        Ok(updated)
    }

    /// All sessions (optionally one client's), newest first.
    pub async fn list_sessions(&self, client_id: Option<&str>) -> Vec<SessionRecord> {
        let sessions = self.sessions.lock().await;
        let mut records: Vec<SessionRecord> = sessions
            .values()
            .filter(|s| client_id.map_or(true, |c| s.client_id == c))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// One session's record.
    pub async fn get_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Whether a session is live: owning client present and ready, session
    /// not terminal.
    pub async fn is_session_active(&self, session_id: &str) -> bool {
        let Some(session) = self.get_session(session_id).await else {
            return false;
        };
        if session.status.is_terminal() {
            return false;
        }
        match self.client_arc(&session.client_id).await {
            Some(client) => client.is_running().await,
            None => false,
        }
    }

    /// Last `max_n` (default full cap) events for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when the event file cannot be read.
    pub async fn get_session_events(
        &self,
        session_id: &str,
        max_n: Option<usize>,
    ) -> Result<Vec<AgentEvent>> {
        self.store
            .tail_events(session_id, max_n.unwrap_or(MAX_SESSION_EVENTS))
            .await
    }

    /// Kill every non-terminal session whose owning client is gone.
    ///
    /// Returns how many sessions were swept.
    pub async fn cleanup_stale(&self) -> usize {
        let candidates: Vec<(String, String)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|s| !s.status.is_terminal())
                .map(|s| (s.id.clone(), s.client_id.clone()))
                .collect()
        };

        let mut swept = 0_usize;
        for (session_id, client_id) in candidates {
            let alive = match self.client_arc(&client_id).await {
                Some(client) => client.is_running().await,
                None => false,
            };
            if !alive {
                let _ = self.broker.expire_session(&session_id).await;
                if self
                    .set_session_status(&session_id, SessionStatus::Killed)
                    .await
                {
                    swept += 1;
                }
            }
        }
        swept
    }

    // ── Approvals ────────────────────────────────────────────────────────

    /// Pending approvals in creation order.
    pub async fn list_approvals(&self) -> Vec<ApprovalRequest> {
        self.broker.list().await
    }

    /// Approve a pending request; the suspended ACP handler answers the
    /// agent with the chosen option and the session resumes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyResolved` when the id is not pending.
    pub async fn approve(&self, approval_id: &str, option_id: &str) -> Result<ApprovalRequest> {
        let request = self.broker.approve(approval_id, option_id).await?;
        self.resume_after_approval(&request.session_id).await;
        Ok(request)
    }

    /// Deny a pending request; the agent receives a cancelled outcome.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyResolved` when the id is not pending.
    pub async fn deny(&self, approval_id: &str) -> Result<ApprovalRequest> {
        let request = self.broker.deny(approval_id).await?;
        self.resume_after_approval(&request.session_id).await;
        Ok(request)
    }

    // ── Streaming ────────────────────────────────────────────────────────

    /// Subscribe to the live stream, optionally filtered to one session.
    #[must_use]
    pub fn subscribe(&self, session_id: Option<String>) -> Subscription {
        self.hub.subscribe(session_id)
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Flush all pending writes and stop every client gracefully.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        self.store.flush_all().await;

        let clients: Vec<(String, Arc<AgentClient>)> = self
            .clients
            .lock()
            .await
            .iter()
            .map(|(id, c)| (id.clone(), Arc::clone(c)))
            .collect();
        for (client_id, client) in clients {
            client.stop(self.config.shutdown_grace()).await;
            self.kill_owned_sessions(&client_id, None).await;
        }
        info!("supervisor shut down");
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn client_arc(&self, client_id: &str) -> Option<Arc<AgentClient>> {
        self.clients.lock().await.get(client_id).cloned()
    }

    /// Newest running ready client for `(kind, canonical cwd)`.
    async fn find_ready(&self, kind: AgentKind, canonical: &std::path::Path) -> Option<Arc<AgentClient>> {
        let candidates: Vec<Arc<AgentClient>> = {
            let clients = self.clients.lock().await;
            clients
                .values()
                .filter(|c| c.kind() == kind && c.cwd() == canonical)
                .cloned()
                .collect()
        };

        let mut best: Option<Arc<AgentClient>> = None;
        for candidate in candidates {
            if candidate.is_running().await {
                let newer = best
                    .as_ref()
                    .map_or(true, |b| candidate.created_at() > b.created_at());
                if newer {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    /// Spawn, register, dispatch, and initialize one client.
    ///
    /// A spawn failure registers nothing; an `initialize` failure leaves
    /// the client listed with status `error`.
    async fn spawn_and_register(self: &Arc<Self>, kind: AgentKind, cwd: PathBuf) -> Result<String> {
        let command = self.config.agent_command(kind);
        let (client, inbound_rx) = AgentClient::spawn(&command, kind, cwd)?;
        self.clients
            .lock()
            .await
            .insert(client.id().to_owned(), Arc::clone(&client));
        self.spawn_dispatch(Arc::clone(&client), inbound_rx).await;
        client.initialize(self.config.startup_timeout()).await?;
        Ok(client.id().to_owned())
    }

    async fn spawn_dispatch(
        self: &Arc<Self>,
        client: Arc<AgentClient>,
        inbound_rx: mpsc::Receiver<Inbound>,
    ) {
        let (progress_tx, progress_rx) = watch::channel(0_u64);
        self.dispatch_progress
            .lock()
            .await
            .insert(client.id().to_owned(), progress_rx);
        let manager = Arc::clone(self);
        tokio::spawn(run_dispatch(manager, client, inbound_rx, progress_tx));
    }

    /// Wait (bounded) until the client's dispatch loop has processed every
    /// frame the transport has delivered so far. Called before appending a
    /// synthetic `complete`/`error` so it lands after the streamed updates
    /// the agent emitted ahead of its response.
    async fn await_dispatch(&self, client: &Arc<AgentClient>) {
        let target = client.delivered_seq();
        let rx = self.dispatch_progress.lock().await.get(client.id()).cloned();
        if let Some(mut rx) = rx {
            let caught_up = tokio::time::timeout(
                std::time::Duration::from_secs(2),
                rx.wait_for(|&processed| processed >= target),
            )
            .await;
            if caught_up.is_err() {
                warn!(client_id = %client.id(), target, "dispatch barrier timed out");
            }
        }
    }

    /// Append an event for a session that still exists; events for deleted
    /// sessions are dropped here, which is what makes `delete_session`
    /// final.
    async fn record_event(&self, client_id: &str, session_id: &str, payload: EventPayload) {
        if !self.sessions.lock().await.contains_key(session_id) {
            debug!(session_id, "dropping event for unknown or deleted session");
            return;
        }
        self.store
            .append_event(AgentEvent::new(client_id, session_id, payload))
            .await;
    }

    /// Apply a monotone status transition in memory and in the store.
    ///
    /// Returns whether the transition was applied.
    async fn set_session_status(&self, session_id: &str, status: SessionStatus) -> bool {
        let applied = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(session_id) {
                Some(session) if session.can_transition_to(status) => {
                    session.status = status;
                    session.updated_at = Utc::now();
                    true
                }
                _ => false,
            }
        };
        if applied {
            if let Err(err) = self.store.update_status(session_id, status).await {
                warn!(session_id, error = %err, "failed to persist status change");
            }
        }
        applied
    }

    /// `waiting-approval → running` once an approval resolves; any other
    /// current status is left alone (the agent's next event drives it).
    async fn resume_after_approval(&self, session_id: &str) {
        let applied = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(session_id) {
                Some(session) if session.status == SessionStatus::WaitingApproval => {
                    session.status = SessionStatus::Running;
                    session.updated_at = Utc::now();
                    true
                }
                _ => false,
            }
        };
        if applied {
            if let Err(err) = self
                .store
                .update_status(session_id, SessionStatus::Running)
                .await
            {
                warn!(session_id, error = %err, "failed to persist approval resume");
            }
        }
    }

    /// Settle a finished prompt turn.
    async fn finish_prompt(
        &self,
        client: &Arc<AgentClient>,
        session_id: &str,
        outcome: Result<wire::PromptResponse>,
    ) {
        // The agent streamed its updates before answering the prompt call;
        // let the dispatch loop finish ingesting them so the synthetic
        // completion lands last.
        self.await_dispatch(client).await;
        let client_id = client.id();
        match outcome {
            Ok(response) => {
                let cancelled = response.stop_reason == "cancelled";
                self.record_event(
                    client_id,
                    session_id,
                    EventPayload::Complete(CompletePayload {
                        stop_reason: response.stop_reason,
                    }),
                )
                .await;
                let next = if cancelled {
                    SessionStatus::Idle
                } else {
                    SessionStatus::Completed
                };
                self.set_session_status(session_id, next).await;
            }
            Err(AppError::Cancelled(_)) => {
                self.record_event(
                    client_id,
                    session_id,
                    EventPayload::Complete(CompletePayload {
                        stop_reason: "cancelled".to_owned(),
                    }),
                )
                .await;
                self.set_session_status(session_id, SessionStatus::Idle)
                    .await;
            }
            Err(err) => {
                self.record_event(
                    client_id,
                    session_id,
                    EventPayload::Error(ErrorPayload {
                        message: format!("prompt failed: {err}"),
                        detail: None,
                    }),
                )
                .await;
                self.set_session_status(session_id, SessionStatus::Error)
                    .await;
            }
        }
    }

    /// Kill the client's non-terminal sessions, expiring their approvals.
    ///
    /// When `error_message` is set an `error` event is appended to each
    /// session first (transport-failure path).
    async fn kill_owned_sessions(&self, client_id: &str, error_message: Option<&str>) {
        let owned: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|s| s.client_id == client_id && !s.status.is_terminal())
                .map(|s| s.id.clone())
                .collect()
        };

        for session_id in owned {
            let _ = self.broker.expire_session(&session_id).await;
            if let Some(message) = error_message {
                self.record_event(
                    client_id,
                    &session_id,
                    EventPayload::Error(ErrorPayload {
                        message: message.to_owned(),
                        detail: None,
                    }),
                )
                .await;
            }
            self.store.flush(&session_id).await;
            self.set_session_status(&session_id, SessionStatus::Killed)
                .await;
        }
    }

    /// Park a `session/request_permission` on the broker; the reply is
    /// sent once an operator decides (or teardown expires the request).
    async fn handle_permission_request(
        self: &Arc<Self>,
        client: &Arc<AgentClient>,
        params: Value,
        responder: Responder,
    ) {
        let parsed: PermissionRequestParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                warn!(client_id = %client.id(), error = %e, "invalid permission request");
                responder.error(-32602, &format!("invalid params: {e}")).await;
                return;
            }
        };

        let session_live = self
            .get_session(&parsed.session_id)
            .await
            .map_or(false, |s| !s.status.is_terminal());
        if !session_live {
            responder.ok(wire::permission_cancelled()).await;
            return;
        }

        let approval = ApprovalRequest::new(
            client.id().to_owned(),
            parsed.session_id.clone(),
            parsed.tool_call,
            parsed.options,
        );
        let decision_rx = self.broker.create(approval).await;
        self.set_session_status(&parsed.session_id, SessionStatus::WaitingApproval)
            .await;

        // Await the decision off the dispatch loop so further inbound
        // frames keep flowing while the operator thinks.
        tokio::spawn(async move {
            match decision_rx.await {
                Ok(ApprovalDecision::Selected { option_id }) => {
                    responder.ok(wire::permission_selected(&option_id)).await;
                }
                Ok(ApprovalDecision::Cancelled) | Err(_) => {
                    responder.ok(wire::permission_cancelled()).await;
                }
            }
        });
    }

    /// One normalized `session/update` arrived for this client.
    async fn ingest_update(&self, client: &Arc<AgentClient>, session_id: &str, payload: EventPayload) {
        if let EventPayload::ModeChange(change) = &payload {
            self.apply_mode_change(session_id, &change.current_mode_id)
                .await;
        }
        self.record_event(client.id(), session_id, payload).await;
    }

    async fn apply_mode_change(&self, session_id: &str, mode_id: &str) {
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get_mut(session_id) {
                session.modes.current_mode_id = Some(mode_id.to_owned());
                session.updated_at = Utc::now();
            }
        }
        if let Err(err) = self.store.update_mode(session_id, mode_id).await {
            warn!(session_id, error = %err, "failed to persist mode change");
        }
    }

    /// The client's transport closed: mark it stopped, error out and kill
    /// its sessions.
    async fn handle_transport_closed(&self, client: &Arc<AgentClient>, reason: &str) {
        warn!(client_id = %client.id(), reason, "client transport closed");
        client
            .set_status(ClientStatus::Stopped, Some(reason.to_owned()))
            .await;
        self.kill_owned_sessions(
            client.id(),
            Some(&format!("agent transport closed: {reason}")),
        )
        .await;
    }
}

/// Per-client dispatch loop: single reader of the transport's inbound
/// channel, which preserves per-session event order end to end.
async fn run_dispatch(
    manager: Arc<SessionManager>,
    client: Arc<AgentClient>,
    mut inbound_rx: mpsc::Receiver<Inbound>,
    progress_tx: watch::Sender<u64>,
) {
    let mut processed: u64 = 0;
    while let Some(frame) = inbound_rx.recv().await {
        match frame {
            Inbound::Notification { method, params } => {
                if method == wire::SESSION_UPDATE {
                    match normalize_session_update(params) {
                        Ok((session_id, payload)) => {
                            manager.ingest_update(&client, &session_id, payload).await;
                        }
                        Err(err) => {
                            warn!(client_id = %client.id(), error = %err, "dropping unusable session/update");
                        }
                    }
                } else {
                    debug!(client_id = %client.id(), method, "ignoring unhandled notification");
                }
            }
            Inbound::Request {
                method,
                params,
                responder,
                ..
            } => {
                if method == wire::SESSION_REQUEST_PERMISSION {
                    manager
                        .handle_permission_request(&client, params, responder)
                        .await;
                } else {
                    debug!(client_id = %client.id(), method, "rejecting unsupported inbound request");
                    responder
                        .error(-32601, &format!("method not supported: {method}"))
                        .await;
                }
            }
            Inbound::Closed { reason } => {
                manager.handle_transport_closed(&client, &reason).await;
                break;
            }
        }
        processed += 1;
        let _ = progress_tx.send(processed);
    }
    debug!(client_id = %client.id(), "dispatch loop finished");
}
