//! The durable event store facade.
//!
//! One `EventStore` owns the metadata repository, the JSONL event log, the
//! write coalescer, and the hub handle. Every append flows through the
//! coalescer; whatever the coalescer releases is written to the session's
//! event file and then published to subscribers, so the log, the hub, and
//! `tail_events` all observe the same per-session sequence.
//!
//! Disk failures never propagate to callers of the append path: the
//! affected session is flipped to `error`, an `error` event is surfaced,
//! and a failure record is queued for the session manager. Other sessions
//! are unaffected.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::hub::{EventHub, StreamItem};
use crate::models::event::{AgentEvent, ErrorPayload, EventPayload};
use crate::models::session::{SessionRecord, SessionStatus};
use crate::{AppError, Result};

use super::coalescer::{Coalescer, FLUSH_DELAY_MS};
use super::db::{self, Database};
use super::event_log::EventLog;
use super::migrate;
use super::session_repo::SessionRepo;

/// Maximum tail length surfaced to subscribers at session load time.
///
/// The file on disk may grow beyond this; the cap governs what is
/// surfaced, not what is retained.
pub const MAX_SESSION_EVENTS: usize = 20_000;

/// Delay between the last event append and the `updated_at` flush.
const TOUCH_DEBOUNCE_MS: u64 = 2_000;

/// Depth of the disk-failure queue consumed by the session manager.
const FAILURE_BUFFER: usize = 64;

/// Database filename inside the store directory.
const DB_FILE: &str = "switchboard.db";

/// One disk failure the session manager must reconcile in memory.
#[derive(Debug, Clone)]
pub struct StoreFailure {
    /// Session whose event could not be written.
    pub session_id: String,
    /// Failure description.
    pub message: String,
}

/// Durable store for session metadata and event streams.
pub struct EventStore {
    repo: SessionRepo,
    log: EventLog,
    coalescer: Coalescer,
    hub: EventHub,
    touch_pending: Mutex<HashMap<String, u64>>,
    touch_generation: AtomicU64,
    failure_tx: mpsc::Sender<StoreFailure>,
    failure_rx: Mutex<Option<mpsc::Receiver<StoreFailure>>>,
}

impl EventStore {
    /// Open (or create) the store rooted at `store_dir`.
    ///
    /// Runs the legacy-directory migration before returning.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` / `AppError::Io` when the directory, the
    /// database, or the migration cannot be set up.
    pub async fn open(store_dir: &Path, hub: EventHub) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(store_dir)
            .await
            .map_err(|e| AppError::Io(format!("failed to create store dir: {e}")))?;

        let database = db::connect(&store_dir.join(DB_FILE)).await?;
        Self::build(database, store_dir, hub, true).await
    }

    /// Open a store with an in-memory database for tests.
    ///
    /// Event files still live under `store_dir`; the legacy migration is
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` when the in-memory database fails to open.
    pub async fn open_in_memory(store_dir: &Path, hub: EventHub) -> Result<Arc<Self>> {
        let database = db::connect_memory().await?;
        Self::build(database, store_dir, hub, false).await
    }

    async fn build(
        database: Database,
        store_dir: &Path,
        hub: EventHub,
        migrate_legacy: bool,
    ) -> Result<Arc<Self>> {
        let repo = SessionRepo::new(Arc::new(database));
        let log = EventLog::new(store_dir.join("events"));

        if migrate_legacy {
            migrate::migrate_legacy(store_dir, &repo, &log).await?;
        }

        let (failure_tx, failure_rx) = mpsc::channel(FAILURE_BUFFER);
        Ok(Arc::new(Self {
            repo,
            log,
            coalescer: Coalescer::new(),
            hub,
            touch_pending: Mutex::new(HashMap::new()),
            touch_generation: AtomicU64::new(0),
            failure_tx,
            failure_rx: Mutex::new(Some(failure_rx)),
        }))
    }

    /// Take the disk-failure queue; yields `None` after the first call.
    pub async fn take_failures(&self) -> Option<mpsc::Receiver<StoreFailure>> {
        self.failure_rx.lock().await.take()
    }

    /// Upsert session metadata and, if supplied, write the initial event
    /// block directly (bypassing the coalescer).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` / `AppError::Io` when the row or an initial
    /// event cannot be written.
    pub async fn save_session(
        &self,
        record: &SessionRecord,
        initial_events: &[AgentEvent],
    ) -> Result<()> {
        self.repo.upsert(record).await?;
        for event in initial_events {
            self.log.append(event).await?;
        }
        Ok(())
    }

    /// Append one event through the coalescer.
    ///
    /// Never fails from the caller's perspective; disk errors are converted
    /// into an `error` event plus a [`StoreFailure`] record (spec'd
    /// propagation policy: background paths convert, they do not throw).
    pub async fn append_event(self: &Arc<Self>, event: AgentEvent) {
        let session_id = event.session_id.clone();
        let outcome = self.coalescer.push(event).await;

        if let Some(flushed) = outcome.flush_first {
            self.write_out(flushed).await;
        }
        if let Some(direct) = outcome.write_now {
            self.write_out(direct).await;
        }
        if let Some(generation) = outcome.buffered_generation {
            let store = Arc::clone(self);
            let sid = session_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(FLUSH_DELAY_MS)).await;
                if let Some(event) = store.coalescer.take_if_current(&sid, generation).await {
                    store.write_out(event).await;
                }
            });
        }

        self.schedule_touch(session_id).await;
    }

    /// Force the session's pending coalesce buffer to disk.
    pub async fn flush(&self, session_id: &str) {
        if let Some(event) = self.coalescer.take(session_id).await {
            self.write_out(event).await;
        }
    }

    /// Force every pending coalesce buffer to disk (graceful shutdown).
    pub async fn flush_all(&self) {
        for event in self.coalescer.take_all().await {
            self.write_out(event).await;
        }
    }

    /// Last `max_n` events for a session in chronological order.
    ///
    /// `max_n` is clamped to [`MAX_SESSION_EVENTS`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when the event file cannot be read.
    pub async fn tail_events(&self, session_id: &str, max_n: usize) -> Result<Vec<AgentEvent>> {
        self.log
            .tail(session_id, max_n.min(MAX_SESSION_EVENTS))
            .await
    }

    /// Load one session's metadata.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on query failure.
    pub async fn load_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        self.repo.get_by_id(id).await
    }

    /// Load all sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on query failure.
    pub async fn load_all_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.repo.list_all().await
    }

    /// Persist a status change; supersedes any pending `updated_at` flush.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on write failure.
    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        self.touch_pending.lock().await.remove(id);
        self.repo.update_status(id, status).await
    }

    /// Persist a rename.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on write failure.
    pub async fn update_name(&self, id: &str, name: Option<&str>) -> Result<()> {
        self.repo.update_name(id, name).await
    }

    /// Persist a mode switch.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on write failure.
    pub async fn update_mode(&self, id: &str, mode_id: &str) -> Result<()> {
        self.repo.update_mode(id, mode_id).await
    }

    /// Persist a project/worktree association.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on write failure.
    pub async fn update_project_context(
        &self,
        id: &str,
        project_id: Option<&str>,
        worktree_id: Option<&str>,
        worktree_branch: Option<&str>,
    ) -> Result<()> {
        self.repo
            .update_project_context(id, project_id, worktree_id, worktree_branch)
            .await
    }

    /// Remove a session's metadata, event file, and pending coalesce
    /// buffer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` / `AppError::Io` when removal fails.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        self.touch_pending.lock().await.remove(id);
        self.coalescer.discard(id).await;
        self.log.delete(id).await?;
        self.repo.delete(id).await
    }

    /// The underlying event log (used by tests and resync paths).
    #[must_use]
    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Write one released event to disk, then publish it.
    async fn write_out(&self, event: AgentEvent) {
        match self.log.append(&event).await {
            Ok(()) => self.hub.publish(StreamItem::Event(event)),
            Err(err) => self.handle_disk_failure(event, &err).await,
        }
    }

    /// Convert a disk failure into an `error` event and a session `error`
    /// status, leaving every other session untouched.
    async fn handle_disk_failure(&self, event: AgentEvent, err: &AppError) {
        let session_id = event.session_id.clone();
        warn!(session_id = %session_id, error = %err, "event append failed");

        if let Err(db_err) = self.repo.update_status(&session_id, SessionStatus::Error).await {
            warn!(session_id = %session_id, error = %db_err, "failed to record error status");
        }

        let error_event = AgentEvent::new(
            &event.client_id,
            &session_id,
            EventPayload::Error(ErrorPayload {
                message: format!("event persistence failed: {err}"),
                detail: None,
            }),
        );
        self.hub.publish(StreamItem::Event(error_event));

        if self
            .failure_tx
            .try_send(StoreFailure {
                session_id,
                message: err.to_string(),
            })
            .is_err()
        {
            debug!("store failure queue full or unclaimed, dropping record");
        }
    }

    /// Debounce the relational `updated_at` refresh ~2 s after the last
    /// append; explicit status changes cancel it.
    async fn schedule_touch(self: &Arc<Self>, session_id: String) {
        let generation = self.touch_generation.fetch_add(1, Ordering::Relaxed);
        self.touch_pending
            .lock()
            .await
            .insert(session_id.clone(), generation);
        let store = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(TOUCH_DEBOUNCE_MS)).await;

            let due = {
                let mut pending = store.touch_pending.lock().await;
                match pending.get(&session_id) {
                    Some(&g) if g == generation => {
                        pending.remove(&session_id);
                        true
                    }
                    _ => false,
                }
            };
            if due {
                if let Err(e) = store.repo.touch(&session_id).await {
                    warn!(session_id = %session_id, error = %e, "updated_at flush failed");
                }
            }
        });
    }
}
