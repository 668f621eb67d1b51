//! Database connection and pool management.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::warn;

use crate::error::StoreError;

/// Embedded migrations, run automatically on connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const MAX_CONNECTIONS: u32 = 5;

/// Connection pool for the record store. Shared between the ingestion path
/// and the read path.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    async fn new(options: SqliteConnectOptions, max: u32) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Connect to the store at the given path, creating the database file
    /// and schema if missing.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = Self::base_options()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::new(options, MAX_CONNECTIONS).await
    }

    /// Connect to an in-memory store. The pool is limited to a single
    /// connection so every caller sees the same database.
    ///
    /// Not `#[cfg(test)]`-gated so dependent crates can use it in their
    /// own tests.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = Self::base_options().filename(":memory:");
        Self::new(options, 1).await
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(1500))
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(MIGRATOR.run(&self.pool).await?)
    }

    /// Health check. A transient failure is retried once before the error
    /// is surfaced; the pool itself reconnects on the next acquire, so a
    /// brief outage costs one failed operation, never the process.
    pub async fn ping(&self) -> Result<(), StoreError> {
        if let Err(first) = sqlx::query("SELECT 1").execute(&self.pool).await {
            warn!(error = %first, "store health check failed, retrying");
            sqlx::query("SELECT 1").execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool. Waits for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
