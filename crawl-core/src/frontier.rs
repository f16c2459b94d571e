//! The URL frontier: admission filtering, exactly-once discovery, and the
//! claim/complete/retry surface the dispatcher works against.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use regex::RegexSet;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::Job;
use crate::normalize;
use crate::page::PageStatus;
use crate::store::{DiscoveredUrl, FrontierEntry, Store};

/// Shallow pages drain first: depth 0 gets priority 10, falling to a floor
/// of 1 for anything at depth 9 or deeper.
pub fn priority_for_depth(depth: i64) -> i64 {
    10 - depth.clamp(0, 9)
}

/// A job's include/exclude patterns, compiled once at dispatch start and
/// reused for every page. Compiling per page would be a performance bug.
pub struct JobFilters {
    include: Option<RegexSet>,
    exclude: Option<RegexSet>,
}

impl JobFilters {
    pub fn compile(include: &[String], exclude: &[String]) -> Result<Self, regex::Error> {
        let include = if include.is_empty() {
            None
        } else {
            Some(RegexSet::new(include)?)
        };
        let exclude = if exclude.is_empty() {
            None
        } else {
            Some(RegexSet::new(exclude)?)
        };
        Ok(Self { include, exclude })
    }

    pub fn for_job(job: &Job) -> Result<Self, regex::Error> {
        Self::compile(&job.include_patterns, &job.exclude_patterns)
    }

    /// Exclude patterns veto first; then, when include patterns exist, at
    /// least one must match.
    pub fn accepts(&self, url: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(url) {
                return false;
            }
        }
        if let Some(include) = &self.include {
            if !include.is_match(url) {
                return false;
            }
        }
        true
    }
}

/// Facade over the store's page and frontier relations.
#[derive(Clone)]
pub struct Frontier {
    store: Store,
}

impl Frontier {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Admit the seed at depth 0. Returns the discovered delta (0 when the
    /// seed already exists, as after a restart).
    pub async fn seed(&self, job_id: Uuid, seed_url: &str) -> Result<u64, StoreError> {
        let normalized = normalize::normalize_url(seed_url);
        let inserted = self
            .store
            .upsert_page(job_id, seed_url, &normalized, 0)
            .await?;
        self.store
            .enqueue_urls(
                job_id,
                &[DiscoveredUrl {
                    url: seed_url.to_owned(),
                    normalized_url: normalized,
                    depth: 0,
                    priority: priority_for_depth(0),
                }],
            )
            .await?;
        Ok(u64::from(inserted))
    }

    /// Run extracted links through the admission pipeline (in-domain,
    /// exclude, include, normalize, dedup) and insert the survivors at
    /// `parent_depth + 1`. Returns only the newly inserted count: the
    /// `discovered` delta. Concurrent overlapping calls cannot double-count
    /// because insertion is insert-if-absent on the dedup key.
    pub async fn discover(
        &self,
        job: &Job,
        filters: &JobFilters,
        parent_depth: i64,
        links: &[String],
    ) -> Result<u64, StoreError> {
        let depth = parent_depth + 1;
        let mut seen = HashSet::new();
        let mut batch = Vec::new();
        for link in links {
            if !normalize::in_domain(link, &job.domain) {
                continue;
            }
            if !filters.accepts(link) {
                continue;
            }
            let normalized = normalize::normalize_url(link);
            if !seen.insert(normalized.clone()) {
                continue;
            }
            batch.push(DiscoveredUrl {
                url: link.clone(),
                normalized_url: normalized,
                depth,
                priority: priority_for_depth(depth),
            });
        }

        if batch.is_empty() {
            return Ok(0);
        }
        let inserted = self.store.batch_upsert_pages(job.id, &batch).await?;
        self.store.enqueue_urls(job.id, &batch).await?;
        Ok(inserted)
    }

    pub async fn claim(
        &self,
        job_id: Uuid,
        batch_size: i64,
    ) -> Result<Vec<FrontierEntry>, StoreError> {
        self.store.claim_pending(job_id, batch_size).await
    }

    pub async fn complete(&self, entry_id: i64) -> Result<(), StoreError> {
        self.store
            .mark_frontier(entry_id, PageStatus::Completed, None, None)
            .await
    }

    /// Return an entry to the pending pool with an increased retry count and
    /// a backoff gate; claims ignore it until `not_before` passes.
    pub async fn retry_later(
        &self,
        entry_id: i64,
        retry_count: i64,
        not_before: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .mark_frontier(entry_id, PageStatus::Pending, Some(retry_count), Some(not_before))
            .await
    }

    /// Mark an entry failed for good; its retry budget is spent.
    pub async fn exhaust(&self, entry_id: i64, retry_count: i64) -> Result<(), StoreError> {
        self.store
            .mark_frontier(entry_id, PageStatus::Failed, Some(retry_count), None)
            .await
    }

    pub async fn skip(&self, entry_id: i64) -> Result<(), StoreError> {
        self.store
            .mark_frontier(entry_id, PageStatus::Skipped, None, None)
            .await
    }

    pub async fn clear(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.store.clear_frontier(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobConfig;
    use crate::store;

    async fn running_job(store: &Store, include: Vec<String>, exclude: Vec<String>) -> Job {
        let mut config = JobConfig::new("https://a.test/");
        config.include_patterns = include;
        config.exclude_patterns = exclude;
        store.create_job(&config, "a.test").await.unwrap()
    }

    #[test]
    fn priority_favors_shallow_pages() {
        assert_eq!(priority_for_depth(0), 10);
        assert_eq!(priority_for_depth(1), 9);
        assert_eq!(priority_for_depth(9), 1);
        assert_eq!(priority_for_depth(40), 1);
    }

    #[test]
    fn filters_apply_exclude_before_include() {
        let filters = JobFilters::compile(
            &["/docs/".to_owned()],
            &["/docs/private".to_owned()],
        )
        .unwrap();
        assert!(filters.accepts("https://a.test/docs/guide"));
        assert!(!filters.accepts("https://a.test/docs/private/key"));
        assert!(!filters.accepts("https://a.test/blog/post"));

        let no_patterns = JobFilters::compile(&[], &[]).unwrap();
        assert!(no_patterns.accepts("https://a.test/anything"));
    }

    #[tokio::test]
    async fn seed_is_idempotent() {
        let store = store::test_store().await;
        let job = running_job(&store, vec![], vec![]).await;
        let frontier = Frontier::new(store.clone());

        assert_eq!(frontier.seed(job.id, "https://a.test/").await.unwrap(), 1);
        // Restart path: seeding again discovers nothing new.
        assert_eq!(frontier.seed(job.id, "https://a.test/").await.unwrap(), 0);
        assert_eq!(store.count_pending(job.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn discover_filters_and_counts_new_urls_only() {
        let store = store::test_store().await;
        let job = running_job(&store, vec![], vec![r"\.pdf$".to_owned()]).await;
        let frontier = Frontier::new(store.clone());
        let filters = JobFilters::for_job(&job).unwrap();

        let links = vec![
            "https://a.test/x".to_owned(),
            "https://sub.a.test/y".to_owned(),
            "https://other.test/offsite".to_owned(),
            "https://a.test/file.pdf".to_owned(),
            "https://a.test/x/".to_owned(),     // dup of /x after normalization
            "https://a.test/x#frag".to_owned(), // dup of /x after normalization
        ];
        let delta = frontier.discover(&job, &filters, 0, &links).await.unwrap();
        assert_eq!(delta, 2);

        // Rediscovering the same set adds nothing.
        let delta = frontier.discover(&job, &filters, 0, &links).await.unwrap();
        assert_eq!(delta, 0);

        let stats = store.queue_stats(job.id).await.unwrap();
        assert_eq!(stats.pending, 2);
    }

    #[tokio::test]
    async fn include_patterns_gate_admission() {
        let store = store::test_store().await;
        let job = running_job(&store, vec!["/docs/".to_owned()], vec![]).await;
        let frontier = Frontier::new(store.clone());
        let filters = JobFilters::for_job(&job).unwrap();

        let links = vec![
            "https://a.test/docs/guide".to_owned(),
            "https://a.test/blog/post".to_owned(),
        ];
        assert_eq!(frontier.discover(&job, &filters, 0, &links).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_cycle_round_trips_through_the_store() {
        let store = store::test_store().await;
        let job = running_job(&store, vec![], vec![]).await;
        let frontier = Frontier::new(store.clone());
        frontier.seed(job.id, "https://a.test/").await.unwrap();

        let entry = frontier.claim(job.id, 1).await.unwrap().remove(0);
        frontier
            .retry_later(entry.id, 1, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();

        let entry = frontier.claim(job.id, 1).await.unwrap().remove(0);
        assert_eq!(entry.retry_count, 1);
        frontier.exhaust(entry.id, 2).await.unwrap();

        let stats = store.queue_stats(job.id).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }
}
