//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` and are safe to
//! re-run on every node start.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS flow_checkpoint (
    flow_id         TEXT PRIMARY KEY NOT NULL,
    flow_type       TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('created','running','suspended','completed','failed','hospitalized')),
    sequence        INTEGER NOT NULL,
    continuation    BLOB NOT NULL,
    body            TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS parked_initiation (
    id              TEXT PRIMARY KEY NOT NULL,
    sender          TEXT NOT NULL,
    message         TEXT NOT NULL,
    reason          TEXT NOT NULL,
    parked_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_flow_checkpoint_status ON flow_checkpoint(status);
CREATE INDEX IF NOT EXISTS idx_flow_checkpoint_updated ON flow_checkpoint(updated_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
