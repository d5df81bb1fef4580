//! Unit tests for the session repository over in-memory `SQLite`.

use std::sync::Arc;

use chrono::{Duration, Utc};

use agent_switchboard::models::agent::AgentKind;
use agent_switchboard::models::session::{
    SessionMode, SessionModeState, SessionRecord, SessionStatus,
};
use agent_switchboard::persistence::db;
use agent_switchboard::persistence::session_repo::SessionRepo;

async fn repo() -> SessionRepo {
    let pool = db::connect_memory().await.expect("in-memory db");
    SessionRepo::new(Arc::new(pool))
}

fn record(id: &str) -> SessionRecord {
    SessionRecord::new(
        id.to_owned(),
        "client-1".to_owned(),
        AgentKind::ClaudeCode,
        "/home/u/proj".into(),
        SessionModeState {
            current_mode_id: Some("code".to_owned()),
            available_modes: vec![SessionMode {
                id: "code".to_owned(),
                name: "Code".to_owned(),
                description: None,
            }],
        },
        Some(serde_json::json!({ "autoApprove": false })),
    )
}

/// Upsert then load returns the same record (modulo `updated_at`).
#[tokio::test]
async fn upsert_round_trips() {
    let repo = repo().await;
    let record = record("sess-1");
    repo.upsert(&record).await.expect("upsert");

    let loaded = repo
        .get_by_id("sess-1")
        .await
        .expect("query")
        .expect("row must exist");

    assert_eq!(loaded.id, record.id);
    assert_eq!(loaded.client_id, record.client_id);
    assert_eq!(loaded.kind, record.kind);
    assert_eq!(loaded.cwd, record.cwd);
    assert_eq!(loaded.status, SessionStatus::Idle);
    assert_eq!(loaded.modes, record.modes);
    assert_eq!(loaded.config_options, record.config_options);
}

/// Unknown ids load as `None`.
#[tokio::test]
async fn missing_row_is_none() {
    let repo = repo().await;
    assert!(repo.get_by_id("ghost").await.expect("query").is_none());
}

/// `list_all` orders newest-first by creation time.
#[tokio::test]
async fn list_all_is_newest_first() {
    let repo = repo().await;

    let mut older = record("older");
    older.created_at = Utc::now() - Duration::minutes(10);
    let newer = record("newer");

    repo.upsert(&older).await.expect("upsert older");
    repo.upsert(&newer).await.expect("upsert newer");

    let all = repo.list_all().await.expect("list");
    let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["newer", "older"]);
}

/// `list_by_client` filters on the owning client.
#[tokio::test]
async fn list_by_client_filters() {
    let repo = repo().await;

    let mine = record("mine");
    let mut other = record("other");
    other.client_id = "client-2".to_owned();

    repo.upsert(&mine).await.expect("upsert");
    repo.upsert(&other).await.expect("upsert");

    let listed = repo.list_by_client("client-1").await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "mine");
}

/// Status, name, mode, and project-context updates persist and advance
/// `updated_at`.
#[tokio::test]
async fn updates_persist() {
    let repo = repo().await;
    let record = record("sess-1");
    repo.upsert(&record).await.expect("upsert");

    repo.update_status("sess-1", SessionStatus::Running)
        .await
        .expect("status");
    repo.update_name("sess-1", Some("refactor storage"))
        .await
        .expect("name");
    repo.update_mode("sess-1", "plan").await.expect("mode");
    repo.update_project_context("sess-1", Some("proj-9"), Some("wt-2"), Some("feature/tail"))
        .await
        .expect("project context");

    let loaded = repo
        .get_by_id("sess-1")
        .await
        .expect("query")
        .expect("row");
    assert_eq!(loaded.status, SessionStatus::Running);
    assert_eq!(loaded.name.as_deref(), Some("refactor storage"));
    assert_eq!(loaded.modes.current_mode_id.as_deref(), Some("plan"));
    assert_eq!(loaded.project_id.as_deref(), Some("proj-9"));
    assert_eq!(loaded.worktree_id.as_deref(), Some("wt-2"));
    assert_eq!(loaded.worktree_branch.as_deref(), Some("feature/tail"));
    assert!(
        loaded.updated_at >= record.updated_at,
        "updates must touch updated_at"
    );
}

/// Deleting removes the row.
#[tokio::test]
async fn delete_removes_row() {
    let repo = repo().await;
    repo.upsert(&record("sess-1")).await.expect("upsert");
    repo.delete("sess-1").await.expect("delete");
    assert!(repo.get_by_id("sess-1").await.expect("query").is_none());
}

/// Every status value survives a round trip through its string form.
#[tokio::test]
async fn all_statuses_round_trip() {
    let repo = repo().await;
    let statuses = [
        SessionStatus::Idle,
        SessionStatus::Starting,
        SessionStatus::Running,
        SessionStatus::WaitingApproval,
        SessionStatus::Completed,
        SessionStatus::Error,
        SessionStatus::Killed,
    ];

    for (i, status) in statuses.into_iter().enumerate() {
        let id = format!("sess-{i}");
        let mut rec = record(&id);
        rec.status = status;
        repo.upsert(&rec).await.expect("upsert");
        let loaded = repo.get_by_id(&id).await.expect("query").expect("row");
        assert_eq!(loaded.status, status, "status {status:?} must round-trip");
    }
}
