//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to
//! re-run on every startup. Produces a convergent result.

use sqlx::SqlitePool;

use crate::Result;

/// Add a column to a table if it does not already exist.
///
/// Uses `PRAGMA table_info` to check column presence before issuing
/// `ALTER TABLE`, making the operation idempotent on repeated startups.
///
/// # Errors
///
/// Returns `AppError::Db` if the PRAGMA query or `ALTER TABLE` fails.
async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    alter_sql: &str,
) -> Result<()> {
    let count: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = '{column}'"
    ))
    .fetch_one(pool)
    .await?;

    if count == 0 {
        sqlx::raw_sql(alter_sql).execute(pool).await?;
    }
    Ok(())
}

/// Create tables and indexes, then apply column migrations.
///
/// # Errors
///
/// Returns `AppError::Db` if any statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS session (
            id              TEXT PRIMARY KEY,
            client_id       TEXT NOT NULL,
            kind            TEXT NOT NULL,
            cwd             TEXT NOT NULL,
            name            TEXT,
            status          TEXT NOT NULL,
            available_modes TEXT NOT NULL DEFAULT '[]',
            current_mode_id TEXT,
            config_options  TEXT,
            project_id      TEXT,
            worktree_id     TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_session_created ON session(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_session_client ON session(client_id, status);",
    )
    .execute(pool)
    .await?;

    // Branch denormalization arrived after the first schema revision.
    add_column_if_missing(
        pool,
        "session",
        "worktree_branch",
        "ALTER TABLE session ADD COLUMN worktree_branch TEXT",
    )
    .await?;

    Ok(())
}
