use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Stored page content is truncated to this many characters before
/// persistence. A storage-cost bound, not a correctness one.
pub const MAX_CONTENT_CHARS: usize = 50_000;

/// Enumeration of possible statuses for a page and for its frontier entry.
///
/// A page is created `pending` on first discovery, moves to `claimed` when a
/// worker takes it, and ends in one of the terminal statuses. A `failed` page
/// may return to `pending` through the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Skipped,
}

impl PageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PageStatus::Completed | PageStatus::Failed | PageStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Pending => "pending",
            PageStatus::Claimed => "claimed",
            PageStatus::Completed => "completed",
            PageStatus::Failed => "failed",
            PageStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PageStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PageStatus::Pending),
            "claimed" => Ok(PageStatus::Claimed),
            "completed" => Ok(PageStatus::Completed),
            "failed" => Ok(PageStatus::Failed),
            "skipped" => Ok(PageStatus::Skipped),
            invalid => Err(StoreError::ParsePageStatusError(invalid.to_owned())),
        }
    }
}

/// A page as persisted in the store. Unique per `(job_id, normalized_url)`;
/// the normalized URL is the dedup key for the whole crawl.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub id: Uuid,
    pub job_id: Uuid,
    /// The URL as discovered, before normalization.
    pub url: String,
    pub normalized_url: String,
    pub depth: i64,
    pub status: PageStatus,
    pub http_status: Option<i64>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Body text, truncated to [`MAX_CONTENT_CHARS`] before persistence.
    pub content: Option<String>,
    pub links_found: i64,
    pub crawled_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: i64,
}

/// Fields settable when a page transitions; unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct PagePatch {
    pub http_status: Option<i64>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub links_found: Option<i64>,
    pub crawled_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: Option<i64>,
}

/// Truncate to at most `max_chars` characters, on a character boundary.
pub fn truncate_content(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((offset, _)) => body[..offset].to_owned(),
        None => body.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_status_round_trips() {
        for status in [
            PageStatus::Pending,
            PageStatus::Claimed,
            PageStatus::Completed,
            PageStatus::Failed,
            PageStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<PageStatus>().unwrap(), status);
        }
        assert!("nope".parse::<PageStatus>().is_err());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_content("hello", 10), "hello");
        assert_eq!(truncate_content("hello", 3), "hel");
        // Multi-byte characters must not be split.
        assert_eq!(truncate_content("héllo", 2), "hé");
        assert_eq!(truncate_content("", 5), "");
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let body = "é".repeat(60_000);
        let truncated = truncate_content(&body, MAX_CONTENT_CHARS);
        assert_eq!(truncated.chars().count(), MAX_CONTENT_CHARS);
    }
}
