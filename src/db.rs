use crate::services::tasks::SqliteTaskStore;
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;

pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("Invalid database url {database_url}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    SqlitePoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(8))
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database pool for {database_url}"))
}

/// Opens the pool and makes sure the task schema exists.
pub async fn open_task_store(database_url: &str) -> Result<SqliteTaskStore> {
    let store = SqliteTaskStore::new(connect(database_url).await?);
    store
        .migrate()
        .await
        .with_context(|| format!("Failed to migrate task schema at {database_url}"))?;
    Ok(store)
}
