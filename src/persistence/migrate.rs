//! One-shot migration of the legacy per-session JSON store.
//!
//! Older builds kept one `sessions/<id>.json` document per session holding
//! metadata and the full event array together. On first open, rows move
//! into the relational store, events move into JSONL files, and the
//! directory is renamed `sessions.bak/` so the migration never runs twice.
//! Documents that fail to parse are left in place and logged; one bad file
//! does not abort the migration.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use crate::models::agent::AgentKind;
use crate::models::event::AgentEvent;
use crate::models::session::{SessionModeState, SessionRecord, SessionStatus};
use crate::Result;

use super::event_log::EventLog;
use super::session_repo::SessionRepo;

/// Migrate `store_dir/sessions/` into the relational store + JSONL files.
///
/// A no-op when the legacy directory does not exist.
///
/// # Errors
///
/// Returns `AppError::Db` when a migrated row cannot be written; parse
/// failures of individual documents are logged and skipped instead.
pub async fn migrate_legacy(store_dir: &Path, repo: &SessionRepo, log: &EventLog) -> Result<()> {
    let legacy_dir = store_dir.join("sessions");
    if !legacy_dir.is_dir() {
        return Ok(());
    }

    info!(dir = %legacy_dir.display(), "migrating legacy session store");
    let mut migrated = 0_usize;

    let mut entries = tokio::fs::read_dir(&legacy_dir)
        .await
        .map_err(|e| crate::AppError::Io(format!("failed to read legacy dir: {e}")))?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match migrate_document(&path, repo, log).await {
            Ok(()) => migrated += 1,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unmigratable session document");
            }
        }
    }

    let backup = store_dir.join("sessions.bak");
    if let Err(e) = tokio::fs::rename(&legacy_dir, &backup).await {
        warn!(error = %e, "failed to rename legacy sessions directory");
    }

    info!(migrated, "legacy session migration finished");
    Ok(())
}

async fn migrate_document(path: &Path, repo: &SessionRepo, log: &EventLog) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| crate::AppError::Io(format!("read failed: {e}")))?;
    let doc: Value = serde_json::from_str(&raw)
        .map_err(|e| crate::AppError::Io(format!("invalid json: {e}")))?;

    let record = record_from_legacy(&doc)
        .ok_or_else(|| crate::AppError::Io("document lacks a session id".into()))?;

    repo.upsert(&record).await?;

    if let Some(events) = doc.get("events").and_then(Value::as_array) {
        for value in events {
            match serde_json::from_value::<AgentEvent>(value.clone()) {
                Ok(event) => log.append(&event).await?,
                Err(e) => {
                    warn!(session_id = %record.id, error = %e, "skipping unmigratable event");
                }
            }
        }
    }

    Ok(())
}

/// Build a session record from a legacy document, tolerating both
/// camelCase and snake_case field spellings.
fn record_from_legacy(doc: &Value) -> Option<SessionRecord> {
    let id = get_str(doc, &["id", "sessionId", "session_id"])?;
    let client_id = get_str(doc, &["clientId", "client_id"]).unwrap_or_default();
    let kind = get_str(doc, &["kind"])
        .and_then(|k| AgentKind::parse(&k))
        .unwrap_or(AgentKind::ClaudeCode);
    let cwd = get_str(doc, &["cwd"]).unwrap_or_default();
    let created_at = get_time(doc, &["createdAt", "created_at"]);
    let updated_at = get_time(doc, &["updatedAt", "updated_at"]);

    Some(SessionRecord {
        id,
        client_id,
        kind,
        cwd: cwd.into(),
        name: get_str(doc, &["name"]),
        // Legacy sessions have no live client; they come back killed and
        // can be revived through reconnect.
        status: SessionStatus::Killed,
        modes: SessionModeState::default(),
        config_options: None,
        project_id: get_str(doc, &["projectId", "project_id"]),
        worktree_id: get_str(doc, &["worktreeId", "worktree_id"]),
        worktree_branch: get_str(doc, &["worktreeBranch", "worktree_branch", "branch"]),
        created_at,
        updated_at,
    })
}

fn get_str(doc: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| doc.get(k).and_then(Value::as_str))
        .map(str::to_owned)
}

fn get_time(doc: &Value, keys: &[&str]) -> DateTime<Utc> {
    keys.iter()
        .find_map(|k| doc.get(k).and_then(Value::as_str))
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc))
}
