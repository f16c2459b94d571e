use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::page::PageStatus;

use super::Store;

/// A URL admitted by the frontier filters, ready to insert.
#[derive(Debug, Clone)]
pub struct DiscoveredUrl {
    pub url: String,
    pub normalized_url: String,
    pub depth: i64,
    pub priority: i64,
}

/// A frontier work item. Unique per `(job_id, normalized_url)`; destroyed on
/// job cancellation or deletion.
#[derive(Debug, Clone)]
pub struct FrontierEntry {
    pub id: i64,
    pub job_id: Uuid,
    pub url: String,
    pub normalized_url: String,
    pub depth: i64,
    pub priority: i64,
    pub retry_count: i64,
    pub status: PageStatus,
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Frontier entry counts by status for one job.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub claimed: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
}

#[derive(sqlx::FromRow)]
struct FrontierRow {
    id: i64,
    job_id: String,
    url: String,
    normalized_url: String,
    depth: i64,
    priority: i64,
    retry_count: i64,
    status: String,
    not_before: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
}

impl TryFrom<FrontierRow> for FrontierEntry {
    type Error = StoreError;

    fn try_from(row: FrontierRow) -> Result<Self, Self::Error> {
        let job_id =
            Uuid::parse_str(&row.job_id).map_err(|_| StoreError::ParseUuidError(row.job_id))?;
        let status: PageStatus = row.status.parse()?;

        Ok(FrontierEntry {
            id: row.id,
            job_id,
            url: row.url,
            normalized_url: row.normalized_url,
            depth: row.depth,
            priority: row.priority,
            retry_count: row.retry_count,
            status,
            not_before: row.not_before,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
        })
    }
}

impl Store {
    /// Batch insert-if-absent of frontier entries. Returns the number of rows
    /// actually inserted.
    pub async fn enqueue_urls(
        &self,
        job_id: Uuid,
        discoveries: &[DiscoveredUrl],
    ) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        let now = Utc::now();
        for chunk in discoveries.chunks(100) {
            let mut builder = sqlx::QueryBuilder::new(
                "INSERT INTO frontier_entry \
                 (job_id, url, normalized_url, depth, priority, status, created_at) ",
            );
            builder.push_values(chunk, |mut row, discovery| {
                row.push_bind(job_id.to_string())
                    .push_bind(&discovery.url)
                    .push_bind(&discovery.normalized_url)
                    .push_bind(discovery.depth)
                    .push_bind(discovery.priority)
                    .push_bind("pending")
                    .push_bind(now);
            });
            builder.push(" ON CONFLICT (job_id, normalized_url) DO NOTHING");

            let result = builder.build().execute(&self.pool).await.map_err(|error| {
                StoreError::QueryError {
                    command: "INSERT".to_owned(),
                    error,
                }
            })?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    /// Atomically claim up to `batch_size` pending entries: highest priority
    /// first, ties broken by age, entries under a backoff gate ignored. The
    /// claim and the status flip happen in one statement, so no two callers
    /// can ever hold the same entry. Matching pages move to `claimed` in the
    /// same transaction.
    pub async fn claim_pending(
        &self,
        job_id: Uuid,
        batch_size: i64,
    ) -> Result<Vec<FrontierEntry>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let now = Utc::now();
        let rows: Vec<FrontierRow> = sqlx::query_as(
            r#"
UPDATE frontier_entry
SET status = 'claimed', claimed_at = ?
WHERE id IN (
    SELECT id
    FROM frontier_entry
    WHERE job_id = ?
      AND status = 'pending'
      AND (not_before IS NULL OR not_before <= ?)
    ORDER BY priority DESC, created_at ASC, id ASC
    LIMIT ?
)
RETURNING id, job_id, url, normalized_url, depth, priority, retry_count, status,
          not_before, created_at, claimed_at
            "#,
        )
        .bind(now)
        .bind(job_id.to_string())
        .bind(now)
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        if !rows.is_empty() {
            let mut builder = sqlx::QueryBuilder::new(
                "UPDATE page SET status = 'claimed' WHERE job_id = ",
            );
            builder.push_bind(job_id.to_string());
            builder.push(" AND normalized_url IN (");
            let mut separated = builder.separated(", ");
            for row in &rows {
                separated.push_bind(&row.normalized_url);
            }
            builder.push(")");
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;
        }

        tx.commit().await.map_err(|error| StoreError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        rows.into_iter().map(FrontierEntry::try_from).collect()
    }

    /// Transition one frontier entry. `retry_count` only overwrites when set;
    /// `not_before` is written as given (None clears any backoff gate).
    pub async fn mark_frontier(
        &self,
        entry_id: i64,
        status: PageStatus,
        retry_count: Option<i64>,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
UPDATE frontier_entry
SET status = ?, retry_count = COALESCE(?, retry_count), not_before = ?
WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(retry_count)
        .bind(not_before)
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;
        Ok(())
    }

    /// Drop every frontier entry of a job; used on cancellation.
    pub async fn clear_frontier(&self, job_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM frontier_entry WHERE job_id = ?")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;
        Ok(())
    }

    /// Pending entries for a job, backoff-gated ones included: they are still
    /// owed an attempt, so the completion detector must count them.
    pub async fn count_pending(&self, job_id: Uuid) -> Result<i64, StoreError> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM frontier_entry WHERE job_id = ? AND status = 'pending'",
        )
        .bind(job_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    pub async fn queue_stats(&self, job_id: Uuid) -> Result<QueueStats, StoreError> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
SELECT
    COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0),
    COALESCE(SUM(CASE WHEN status = 'claimed' THEN 1 ELSE 0 END), 0),
    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
    COALESCE(SUM(CASE WHEN status = 'skipped' THEN 1 ELSE 0 END), 0)
FROM frontier_entry
WHERE job_id = ?
            "#,
        )
        .bind(job_id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(QueueStats {
            pending: row.0,
            claimed: row.1,
            completed: row.2,
            failed: row.3,
            skipped: row.4,
        })
    }

    /// Return claims orphaned by a dead dispatcher to the pending pool.
    /// Startup recovery runs this before rebinding a job.
    pub async fn reset_claimed(&self, job_id: Uuid) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let result = sqlx::query(
            "UPDATE frontier_entry SET status = 'pending', claimed_at = NULL \
             WHERE job_id = ? AND status = 'claimed'",
        )
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        sqlx::query("UPDATE page SET status = 'pending' WHERE job_id = ? AND status = 'claimed'")
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        tx.commit().await.map_err(|error| StoreError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(result.rows_affected())
    }

    /// Mark every still-pending entry (and page) skipped; used when the page
    /// budget is exhausted. Claimed in-flight entries are left to finish.
    /// Returns the number of entries skipped.
    pub async fn skip_remaining_pending(&self, job_id: Uuid) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::QueryError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let result = sqlx::query(
            "UPDATE frontier_entry SET status = 'skipped' WHERE job_id = ? AND status = 'pending'",
        )
        .bind(job_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        sqlx::query("UPDATE page SET status = 'skipped' WHERE job_id = ? AND status = 'pending'")
            .bind(job_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        tx.commit().await.map_err(|error| StoreError::QueryError {
            command: "COMMIT".to_owned(),
            error,
        })?;

        Ok(result.rows_affected())
    }
}
