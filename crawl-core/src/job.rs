use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CrawlError, StoreError};
use crate::normalize;

/// Enumeration of possible statuses for a crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// A job that has been created but whose dispatcher has not started yet.
    Pending,
    /// A job whose dispatcher is actively claiming and fetching pages.
    Running,
    /// A job halted by the user; workers are parked and can be resumed.
    Paused,
    /// A job whose frontier drained (or whose page budget was reached).
    Completed,
    /// A job that ended with every attempted page failing, or that hit a
    /// fatal initialization error.
    Failed,
    /// A job cancelled by the user; its frontier has been cleared.
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are absorbing: no transition ever leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the lifecycle state machine permits moving to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Pending, JobStatus::Cancelled) => true,
            (JobStatus::Pending, JobStatus::Failed) => true,
            (JobStatus::Running, JobStatus::Paused) => true,
            (JobStatus::Running, JobStatus::Completed) => true,
            (JobStatus::Running, JobStatus::Failed) => true,
            (JobStatus::Running, JobStatus::Cancelled) => true,
            (JobStatus::Paused, JobStatus::Running) => true,
            (JobStatus::Paused, JobStatus::Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allow casting JobStatus from strings.
impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            invalid => Err(StoreError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

/// Counters tracked per job, incremented atomically in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterField {
    Discovered,
    Crawled,
    Failed,
    Skipped,
}

impl CounterField {
    pub fn column(&self) -> &'static str {
        match self {
            CounterField::Discovered => "discovered",
            CounterField::Crawled => "crawled",
            CounterField::Failed => "failed",
            CounterField::Skipped => "skipped",
        }
    }
}

pub const MIN_DEPTH: u32 = 1;
pub const MAX_DEPTH: u32 = 50;
pub const MIN_PAGES: i64 = 1;
pub const MAX_PAGES: i64 = 150_000;
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 50;
pub const MIN_CRAWL_DELAY_MS: u64 = 100;
pub const MAX_CRAWL_DELAY_MS: u64 = 10_000;

/// Immutable configuration for a crawl job, validated at admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub seed_url: String,
    pub max_depth: u32,
    pub max_pages: i64,
    pub max_workers: usize,
    pub crawl_delay_ms: u64,
    pub respect_robots: bool,
    /// When non-empty, a URL must match at least one of these to be enqueued.
    pub include_patterns: Vec<String>,
    /// A URL matching any of these is rejected, before include patterns apply.
    pub exclude_patterns: Vec<String>,
}

impl JobConfig {
    pub fn new(seed_url: &str) -> Self {
        Self {
            seed_url: seed_url.to_owned(),
            max_depth: 10,
            max_pages: 100_000,
            max_workers: 10,
            crawl_delay_ms: 1_000,
            respect_robots: true,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }

    /// Validate ranges, patterns, and the seed URL. Returns the crawl domain
    /// (the seed's host) on success. Out-of-range values are rejected without
    /// clamping so the caller can map them to a 400.
    pub fn validate(&self) -> Result<String, CrawlError> {
        if !(MIN_DEPTH..=MAX_DEPTH).contains(&self.max_depth) {
            return Err(CrawlError::InvalidConfig {
                field: "max_depth",
                message: format!("must be between {} and {}", MIN_DEPTH, MAX_DEPTH),
            });
        }
        if !(MIN_PAGES..=MAX_PAGES).contains(&self.max_pages) {
            return Err(CrawlError::InvalidConfig {
                field: "max_pages",
                message: format!("must be between {} and {}", MIN_PAGES, MAX_PAGES),
            });
        }
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.max_workers) {
            return Err(CrawlError::InvalidConfig {
                field: "max_concurrent_workers",
                message: format!("must be between {} and {}", MIN_WORKERS, MAX_WORKERS),
            });
        }
        if !(MIN_CRAWL_DELAY_MS..=MAX_CRAWL_DELAY_MS).contains(&self.crawl_delay_ms) {
            return Err(CrawlError::InvalidConfig {
                field: "crawl_delay_ms",
                message: format!(
                    "must be between {} and {}",
                    MIN_CRAWL_DELAY_MS, MAX_CRAWL_DELAY_MS
                ),
            });
        }
        for pattern in self.include_patterns.iter().chain(&self.exclude_patterns) {
            if let Err(error) = regex::Regex::new(pattern) {
                return Err(CrawlError::InvalidConfig {
                    field: "patterns",
                    message: format!("{pattern} is not a valid regex: {error}"),
                });
            }
        }

        let url = url::Url::parse(&self.seed_url)
            .map_err(|_| CrawlError::InvalidSeedUrl(self.seed_url.clone()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CrawlError::InvalidSeedUrl(self.seed_url.clone()));
        }
        normalize::host_of(&self.seed_url)
            .ok_or_else(|| CrawlError::InvalidSeedUrl(self.seed_url.clone()))
    }
}

/// A crawl job as persisted in the store.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// A unique id identifying a job.
    pub id: Uuid,
    /// The URL the crawl starts from.
    pub seed_url: String,
    /// The authoritative domain; the crawl never leaves it or its subdomains.
    pub domain: String,
    pub max_depth: u32,
    pub max_pages: i64,
    pub max_workers: usize,
    pub crawl_delay_ms: u64,
    pub respect_robots: bool,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub status: JobStatus,
    /// URLs discovered and admitted to the frontier, the seed included.
    pub discovered: i64,
    /// Pages fetched and persisted successfully.
    pub crawled: i64,
    /// Pages that exhausted their retries or failed fatally.
    pub failed: i64,
    /// Pages denied by robots.txt or dropped by the page budget.
    pub skipped: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Pages crawled per second since the job started.
    pub fn crawl_rate(&self) -> Option<f64> {
        let started_at = self.started_at?;
        let elapsed = (Utc::now() - started_at).num_milliseconds();
        if elapsed <= 0 || self.crawled == 0 {
            return None;
        }
        Some(self.crawled as f64 / (elapsed as f64 / 1_000.0))
    }

    /// Estimated seconds until completion, given the current pending count.
    /// None when the rate is unknown or nothing remains.
    pub fn eta_seconds(&self, pending: i64) -> Option<f64> {
        let rate = self.crawl_rate()?;
        let budget_left = (self.max_pages - self.crawled).max(0);
        let remaining = pending.min(budget_left);
        if remaining <= 0 {
            return None;
        }
        Some(remaining as f64 / rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_absorbing() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Paused,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn lifecycle_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Paused));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Paused.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn config_validation_rejects_out_of_range() {
        let mut config = JobConfig::new("https://example.com/");
        assert_eq!(config.validate().unwrap(), "example.com");

        config.max_depth = 0;
        assert!(config.validate().is_err());
        config.max_depth = 51;
        assert!(config.validate().is_err());
        config.max_depth = 10;

        config.max_pages = 0;
        assert!(config.validate().is_err());
        config.max_pages = 150_001;
        assert!(config.validate().is_err());
        config.max_pages = 100;

        config.crawl_delay_ms = 99;
        assert!(config.validate().is_err());
        config.crawl_delay_ms = 1_000;

        config.max_workers = 51;
        assert!(config.validate().is_err());
        config.max_workers = 10;

        config.exclude_patterns = vec!["(".to_owned()];
        assert!(config.validate().is_err());
        config.exclude_patterns = vec![r"\.pdf$".to_owned()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_validation_rejects_bad_seeds() {
        assert!(JobConfig::new("not a url").validate().is_err());
        assert!(JobConfig::new("ftp://example.com/").validate().is_err());
        assert!(JobConfig::new("https:///nohost").validate().is_err());
    }

    #[test]
    fn crawl_rate_and_eta() {
        let mut job = Job {
            id: Uuid::new_v4(),
            seed_url: "https://example.com/".to_owned(),
            domain: "example.com".to_owned(),
            max_depth: 10,
            max_pages: 1_000,
            max_workers: 10,
            crawl_delay_ms: 1_000,
            respect_robots: true,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            status: JobStatus::Running,
            discovered: 100,
            crawled: 50,
            failed: 0,
            skipped: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now() - chrono::Duration::seconds(50)),
            completed_at: None,
            updated_at: Utc::now(),
        };

        let rate = job.crawl_rate().unwrap();
        assert!(rate > 0.5 && rate < 1.5, "rate was {rate}");
        let eta = job.eta_seconds(50).unwrap();
        assert!(eta > 25.0 && eta < 100.0, "eta was {eta}");

        job.started_at = None;
        assert!(job.crawl_rate().is_none());
        assert!(job.eta_seconds(50).is_none());
    }
}
