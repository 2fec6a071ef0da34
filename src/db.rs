//! SQLite connection management for the cache index.
//!
//! Connections use WAL journal mode so cache reads from a running search
//! never block behind a concurrent write-behind upsert. The database file
//! and its parent directories are created on first use.

use anyhow::{anyhow, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::config::Config;

/// Create a connection pool to the configured cache database.
///
/// # Errors
///
/// Returns an error if `cache.path` is unset or the database cannot be
/// created or opened.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = config
        .cache
        .path
        .as_deref()
        .ok_or_else(|| anyhow!("cache.path is not configured"))?;
    connect_path(db_path).await
}

/// Create a connection pool to the SQLite database at `db_path`.
pub async fn connect_path(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
