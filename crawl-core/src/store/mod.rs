//! Durable persistence for jobs, pages, the frontier, and the robots cache.
//!
//! Backed by a SQLite database through sqlx. Every mutation is a single
//! statement or an explicit transaction; counters are incremented in SQL, and
//! the claim primitive is one atomic `UPDATE ... RETURNING`, so concurrent
//! workers can never claim the same entry twice.

mod frontier;
mod jobs;
mod pages;
mod robots;

pub use frontier::{DiscoveredUrl, FrontierEntry, QueueStats};
pub use jobs::JobPatch;
pub use robots::RobotsRecord;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::StoreError;

/// Handle on the durable store. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `url` and ensure the schema
    /// exists. In-memory databases get a single connection so every handle
    /// sees the same data.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(|error| StoreError::ConnectionError { error })?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    /// Liveness probe for the database connection.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;
        Ok(())
    }

    /// Liveness probe for the frontier relation specifically.
    pub async fn ping_frontier(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT COUNT(*) FROM frontier_entry")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;
        Ok(())
    }

    async fn create_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
CREATE TABLE IF NOT EXISTS job (
    id TEXT PRIMARY KEY,
    seed_url TEXT NOT NULL,
    domain TEXT NOT NULL,
    max_depth INTEGER NOT NULL,
    max_pages INTEGER NOT NULL,
    max_workers INTEGER NOT NULL,
    crawl_delay_ms INTEGER NOT NULL,
    respect_robots INTEGER NOT NULL,
    include_patterns TEXT NOT NULL DEFAULT '[]',
    exclude_patterns TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending',
    discovered INTEGER NOT NULL DEFAULT 0,
    crawled INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    skipped INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL
)
            "#,
            r#"
CREATE TABLE IF NOT EXISTS page (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL REFERENCES job (id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    normalized_url TEXT NOT NULL,
    depth INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    http_status INTEGER,
    content_type TEXT,
    content_length INTEGER,
    title TEXT,
    description TEXT,
    content TEXT,
    links_found INTEGER NOT NULL DEFAULT 0,
    crawled_at TEXT,
    duration_ms INTEGER,
    error_message TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE (job_id, normalized_url)
)
            "#,
            "CREATE INDEX IF NOT EXISTS idx_page_job_status ON page (job_id, status)",
            r#"
CREATE TABLE IF NOT EXISTS frontier_entry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES job (id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    normalized_url TEXT NOT NULL,
    depth INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    not_before TEXT,
    created_at TEXT NOT NULL,
    claimed_at TEXT,
    UNIQUE (job_id, normalized_url)
)
            "#,
            "CREATE INDEX IF NOT EXISTS idx_frontier_claim ON frontier_entry (job_id, status, priority, created_at)",
            r#"
CREATE TABLE IF NOT EXISTS robots_record (
    domain TEXT PRIMARY KEY,
    body TEXT,
    crawl_delay_secs REAL,
    fetched_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
)
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "CREATE".to_owned(),
                    error,
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn test_store() -> Store {
    Store::connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory store")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let store = test_store().await;
        store.create_schema().await.expect("second bootstrap failed");
        store.ping().await.expect("ping failed");
        store.ping_frontier().await.expect("frontier ping failed");
    }
}
