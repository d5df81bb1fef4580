//! Session repository for `SQLite` persistence.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::models::agent::AgentKind;
use crate::models::session::{SessionMode, SessionModeState, SessionRecord, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    client_id: String,
    kind: String,
    cwd: String,
    name: Option<String>,
    status: String,
    available_modes: String,
    current_mode_id: Option<String>,
    config_options: Option<String>,
    project_id: Option<String>,
    worktree_id: Option<String>,
    worktree_branch: Option<String>,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    /// Convert a database row into the domain model.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if enum parsing or JSON deserialization fails.
    fn into_record(self) -> Result<SessionRecord> {
        let status = parse_status(&self.status)?;
        let kind = AgentKind::parse(&self.kind)
            .ok_or_else(|| AppError::Db(format!("invalid agent kind: {}", self.kind)))?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);
        let updated_at = chrono::DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| AppError::Db(format!("invalid updated_at: {e}")))?
            .with_timezone(&Utc);
        let available_modes: Vec<SessionMode> = serde_json::from_str(&self.available_modes)
            .map_err(|e| AppError::Db(format!("invalid available_modes json: {e}")))?;
        let config_options = self
            .config_options
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid config_options json: {e}")))?;

        Ok(SessionRecord {
            id: self.id,
            client_id: self.client_id,
            kind,
            cwd: PathBuf::from(self.cwd),
            name: self.name,
            status,
            modes: SessionModeState {
                current_mode_id: self.current_mode_id,
                available_modes,
            },
            config_options,
            project_id: self.project_id,
            worktree_id: self.worktree_id,
            worktree_branch: self.worktree_branch,
            created_at,
            updated_at,
        })
    }
}

/// Parse a status string into the domain enum.
fn parse_status(s: &str) -> Result<SessionStatus> {
    match s {
        "idle" => Ok(SessionStatus::Idle),
        "starting" => Ok(SessionStatus::Starting),
        "running" => Ok(SessionStatus::Running),
        "waiting-approval" => Ok(SessionStatus::WaitingApproval),
        "completed" => Ok(SessionStatus::Completed),
        "error" => Ok(SessionStatus::Error),
        "killed" => Ok(SessionStatus::Killed),
        other => Err(AppError::Db(format!("invalid session status: {other}"))),
    }
}

/// Serialize a status enum to its database string.
fn status_str(s: SessionStatus) -> &'static str {
    match s {
        SessionStatus::Idle => "idle",
        SessionStatus::Starting => "starting",
        SessionStatus::Running => "running",
        SessionStatus::WaitingApproval => "waiting-approval",
        SessionStatus::Completed => "completed",
        SessionStatus::Error => "error",
        SessionStatus::Killed => "killed",
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace a session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if serialization or the write fails.
    pub async fn upsert(&self, record: &SessionRecord) -> Result<()> {
        let status = status_str(record.status);
        let available_modes = serde_json::to_string(&record.modes.available_modes)
            .map_err(|e| AppError::Db(format!("failed to serialize available_modes: {e}")))?;
        let config_options = record
            .config_options
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AppError::Db(format!("failed to serialize config_options: {e}")))?;

        sqlx::query(
            "INSERT OR REPLACE INTO session (id, client_id, kind, cwd, name, status,
             available_modes, current_mode_id, config_options, project_id, worktree_id,
             worktree_branch, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&record.id)
        .bind(&record.client_id)
        .bind(record.kind.as_str())
        .bind(record.cwd.to_string_lossy().into_owned())
        .bind(&record.name)
        .bind(status)
        .bind(&available_modes)
        .bind(&record.modes.current_mode_id)
        .bind(&config_options)
        .bind(&record.project_id)
        .bind(&record.worktree_id)
        .bind(&record.worktree_branch)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(())
    }

    /// Retrieve a session by identifier.
    ///
    /// Returns `Ok(None)` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<SessionRecord>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM session WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_record).transpose()
    }

    /// List all sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_all(&self) -> Result<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM session ORDER BY created_at DESC")
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(SessionRow::into_record).collect()
    }

    /// List the sessions owned by one client, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_client(&self, client_id: &str) -> Result<Vec<SessionRecord>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT * FROM session WHERE client_id = ?1 ORDER BY created_at DESC",
        )
        .bind(client_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_record).collect()
    }

    /// Update session status and `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE session SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status_str(status))
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Update the user-assigned display name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_name(&self, id: &str, name: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE session SET name = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(name)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Update the selected mode.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_mode(&self, id: &str, mode_id: &str) -> Result<()> {
        sqlx::query("UPDATE session SET current_mode_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(mode_id)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Update the project/worktree association.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_project_context(
        &self,
        id: &str,
        project_id: Option<&str>,
        worktree_id: Option<&str>,
        worktree_branch: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE session SET project_id = ?1, worktree_id = ?2, worktree_branch = ?3,
             updated_at = ?4 WHERE id = ?5",
        )
        .bind(project_id)
        .bind(worktree_id)
        .bind(worktree_branch)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Refresh `updated_at` only; used by the debounced event-append path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn touch(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE session SET updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Delete a session row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM session WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }
}
