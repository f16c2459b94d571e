use std::time;

use thiserror::Error;
use uuid::Uuid;

/// Enumeration of errors for operations on the durable store.
/// Errors that can originate from sqlx are wrapped to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid job status")]
    ParseJobStatusError(String),
    #[error("{0} is not a valid page status")]
    ParsePageStatusError(String),
    #[error("{0} is not a valid uuid")]
    ParseUuidError(String),
    #[error("failed to decode stored row: {0}")]
    DecodeError(String),
    #[error("job {0} does not exist")]
    JobNotFound(Uuid),
    #[error("page {0} does not exist")]
    PageNotFound(Uuid),
}

/// Enumeration of errors for a single page fetch.
///
/// The split mirrors the crawl error taxonomy: a retryable failure is
/// re-enqueued with backoff until the entry's retry budget is exhausted, a
/// fatal failure marks the page failed immediately.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("fetch failed but may succeed if retried later: {message}")]
    Retryable {
        message: String,
        /// HTTP status, when the failure came from a response rather than the transport.
        status: Option<u16>,
        /// Server-provided Retry-After, honored when throttling the origin.
        retry_after: Option<time::Duration>,
    },
    #[error("fetch failed and cannot be retried: {message}")]
    Fatal {
        message: String,
        status: Option<u16>,
    },
}

impl FetchError {
    /// HTTP status attached to the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Retryable { status, .. } => *status,
            FetchError::Fatal { status, .. } => *status,
        }
    }
}

/// Enumeration of errors surfaced by job lifecycle operations.
#[derive(Error, Debug)]
pub enum CrawlError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid seed url: {0}")]
    InvalidSeedUrl(String),
    #[error("invalid {field}: {message}")]
    InvalidConfig { field: &'static str, message: String },
    #[error("job {id} is {status} and cannot be {action}")]
    InvalidTransition {
        id: Uuid,
        status: String,
        action: &'static str,
    },
}

impl CrawlError {
    /// Whether this error is a rejection of user input rather than an
    /// internal failure. Validation errors map to a 400 at the API boundary
    /// and cause no state change.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CrawlError::InvalidSeedUrl(_)
                | CrawlError::InvalidConfig { .. }
                | CrawlError::InvalidTransition { .. }
        )
    }
}
