use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{CounterField, Job, JobConfig, JobStatus};

use super::Store;

/// Mutable job fields settable alongside a status transition. Unset fields
/// keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    seed_url: String,
    domain: String,
    max_depth: i64,
    max_pages: i64,
    max_workers: i64,
    crawl_delay_ms: i64,
    respect_robots: bool,
    include_patterns: String,
    exclude_patterns: String,
    status: String,
    discovered: i64,
    crawled: i64,
    failed: i64,
    skipped: i64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id).map_err(|_| StoreError::ParseUuidError(row.id))?;
        let status: JobStatus = row.status.parse()?;
        let include_patterns: Vec<String> = serde_json::from_str(&row.include_patterns)
            .map_err(|error| StoreError::DecodeError(error.to_string()))?;
        let exclude_patterns: Vec<String> = serde_json::from_str(&row.exclude_patterns)
            .map_err(|error| StoreError::DecodeError(error.to_string()))?;

        Ok(Job {
            id,
            seed_url: row.seed_url,
            domain: row.domain,
            max_depth: row.max_depth as u32,
            max_pages: row.max_pages,
            max_workers: row.max_workers as usize,
            crawl_delay_ms: row.crawl_delay_ms as u64,
            respect_robots: row.respect_robots,
            include_patterns,
            exclude_patterns,
            status,
            discovered: row.discovered,
            crawled: row.crawled,
            failed: row.failed,
            skipped: row.skipped,
            last_error: row.last_error,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

const JOB_COLUMNS: &str = "id, seed_url, domain, max_depth, max_pages, max_workers, \
     crawl_delay_ms, respect_robots, include_patterns, exclude_patterns, status, \
     discovered, crawled, failed, skipped, last_error, created_at, started_at, \
     completed_at, updated_at";

impl Store {
    /// Persist a new job from validated configuration. The job starts
    /// `pending` with zeroed counters.
    pub async fn create_job(&self, config: &JobConfig, domain: &str) -> Result<Job, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let include_patterns = serde_json::to_string(&config.include_patterns)
            .map_err(|error| StoreError::DecodeError(error.to_string()))?;
        let exclude_patterns = serde_json::to_string(&config.exclude_patterns)
            .map_err(|error| StoreError::DecodeError(error.to_string()))?;

        sqlx::query(
            r#"
INSERT INTO job
    (id, seed_url, domain, max_depth, max_pages, max_workers, crawl_delay_ms,
     respect_robots, include_patterns, exclude_patterns, status, created_at, updated_at)
VALUES
    (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&config.seed_url)
        .bind(domain)
        .bind(config.max_depth as i64)
        .bind(config.max_pages)
        .bind(config.max_workers as i64)
        .bind(config.crawl_delay_ms as i64)
        .bind(config.respect_robots)
        .bind(&include_patterns)
        .bind(&exclude_patterns)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        self.get_job(id).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM job WHERE id = ?");
        let row: Option<JobRow> = sqlx::query_as(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        row.ok_or(StoreError::JobNotFound(id))?.try_into()
    }

    /// Jobs ordered newest first, optionally filtered by status, plus the
    /// total count matching the filter.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Job>, i64), StoreError> {
        let (filter, count_query) = match status {
            Some(_) => (
                " WHERE status = ?",
                "SELECT COUNT(*) FROM job WHERE status = ?",
            ),
            None => ("", "SELECT COUNT(*) FROM job"),
        };
        let query =
            format!("SELECT {JOB_COLUMNS} FROM job{filter} ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut select = sqlx::query_as::<_, JobRow>(&query);
        let mut count = sqlx::query_scalar::<_, i64>(count_query);
        if let Some(status) = status {
            select = select.bind(status.as_str());
            count = count.bind(status.as_str());
        }

        let rows = select
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;
        let total = count
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        let jobs = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total))
    }

    /// Move a job to `status`, applying any patch fields. When `expected` is
    /// set the update only applies if the job is still in that status;
    /// returns whether a row was updated. This is the optimistic guard the
    /// lifecycle state machine relies on.
    pub async fn update_job_status(
        &self,
        id: Uuid,
        expected: Option<JobStatus>,
        status: JobStatus,
        patch: JobPatch,
    ) -> Result<bool, StoreError> {
        let guard = match expected {
            Some(_) => " AND status = ?",
            None => "",
        };
        let query = format!(
            r#"
UPDATE job
SET
    status = ?,
    updated_at = ?,
    started_at = COALESCE(?, started_at),
    completed_at = COALESCE(?, completed_at),
    last_error = COALESCE(?, last_error)
WHERE id = ?{guard}
            "#
        );

        let mut update = sqlx::query(&query)
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(patch.started_at)
            .bind(patch.completed_at)
            .bind(patch.last_error)
            .bind(id.to_string());
        if let Some(expected) = expected {
            update = update.bind(expected.as_str());
        }

        let result = update
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;
        Ok(result.rows_affected() > 0)
    }

    /// Atomically add `delta` to one of the job counters. The crawled counter
    /// is capped at `max_pages` in SQL so the budget invariant can never be
    /// violated, even by in-flight fetches finishing after the budget check.
    pub async fn increment_counter(
        &self,
        id: Uuid,
        field: CounterField,
        delta: i64,
    ) -> Result<(), StoreError> {
        let column = field.column();
        let query = match field {
            CounterField::Crawled => format!(
                "UPDATE job SET {column} = MIN({column} + ?, max_pages), updated_at = ? WHERE id = ?"
            ),
            _ => format!("UPDATE job SET {column} = {column} + ?, updated_at = ? WHERE id = ?"),
        };

        sqlx::query(&query)
            .bind(delta)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;
        Ok(())
    }

    /// Record a non-fatal error on the job without touching its status.
    pub async fn record_job_error(&self, id: Uuid, message: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE job SET last_error = ?, updated_at = ? WHERE id = ?")
            .bind(message)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;
        Ok(())
    }

    /// Jobs that should have a live dispatcher: used by startup recovery to
    /// rebind work orphaned by a process restart.
    pub async fn resumable_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE status IN ('running', 'pending') ORDER BY created_at"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        rows.into_iter().map(Job::try_from).collect()
    }
}
