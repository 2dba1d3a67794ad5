//! `SQLite` connection pool setup and schema bootstrap.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::{AppError, Result};

use super::schema;

/// Alias for the shared `SQLite` pool.
pub type Database = SqlitePool;

/// Open (creating if needed) a file-backed database and apply the schema.
///
/// # Errors
///
/// Returns `AppError::Db` if the directory cannot be created, the
/// connection fails, or schema bootstrap fails.
pub async fn connect(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|err| AppError::Db(format!("failed to create db dir: {err}")))?;
        }
    }

    let url = format!("sqlite://{}", path.display());
    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Open an in-memory database and apply the schema.
///
/// The pool holds exactly one connection that is never recycled, since
/// every in-memory connection is a separate database.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema bootstrap fails.
pub async fn connect_memory() -> Result<Database> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}
