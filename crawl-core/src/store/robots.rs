use chrono::{DateTime, Utc};

use crate::error::StoreError;

use super::Store;

/// A cached robots.txt document for one domain, shared across jobs.
/// A NULL body means the origin has no robots.txt: allow everything.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RobotsRecord {
    pub domain: String,
    pub body: Option<String>,
    pub crawl_delay_secs: Option<f64>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Store {
    pub async fn upsert_robots(&self, record: &RobotsRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO robots_record (domain, body, crawl_delay_secs, fetched_at, expires_at)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT (domain) DO UPDATE SET
    body = excluded.body,
    crawl_delay_secs = excluded.crawl_delay_secs,
    fetched_at = excluded.fetched_at,
    expires_at = excluded.expires_at
            "#,
        )
        .bind(&record.domain)
        .bind(&record.body)
        .bind(record.crawl_delay_secs)
        .bind(record.fetched_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;
        Ok(())
    }

    /// The stored record for a domain, if it exists and has not expired.
    pub async fn get_robots(&self, domain: &str) -> Result<Option<RobotsRecord>, StoreError> {
        sqlx::query_as(
            "SELECT domain, body, crawl_delay_secs, fetched_at, expires_at \
             FROM robots_record WHERE domain = ? AND expires_at > ?",
        )
        .bind(domain)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }
}
