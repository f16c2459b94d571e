//! The crawl execution core: a pool of workers driving one job's frontier.
//!
//! Each worker loops: observe the job status, claim an entry, consult robots,
//! wait for the origin's rate-limit slot, fetch, persist, discover. Workers
//! are cooperative with respect to pause and cancel: they check status
//! between steps but never abandon an in-flight fetch, so a fetched page is
//! always persisted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::error::{FetchError, StoreError};
use crate::extract;
use crate::fetch::{is_throttle_status, FetchedPage, Fetcher};
use crate::frontier::{Frontier, JobFilters};
use crate::job::{CounterField, Job, JobStatus};
use crate::limiter::RateLimiters;
use crate::normalize;
use crate::page::{truncate_content, PagePatch, PageStatus, MAX_CONTENT_CHARS};
use crate::retry::RetryPolicy;
use crate::robots::RobotsPolicy;
use crate::store::{FrontierEntry, Store};

/// Dispatch tunables; the defaults match production behavior, tests shrink
/// the intervals.
#[derive(Clone)]
pub struct DispatcherConfig {
    pub retry_policy: RetryPolicy,
    /// Throttle window applied on 429/503 without a Retry-After header.
    pub throttle_default: Duration,
    /// Jitter bounds for the empty-claim backoff, avoiding a thundering-herd
    /// poll against the store.
    pub claim_backoff_min: Duration,
    pub claim_backoff_max: Duration,
    /// Consecutive empty claims before a worker yields for `idle_backoff`.
    pub empty_claims_before_yield: u32,
    pub idle_backoff: Duration,
    /// How often a parked worker re-checks a paused job.
    pub pause_poll: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            throttle_default: Duration::from_secs(60),
            claim_backoff_min: Duration::from_millis(250),
            claim_backoff_max: Duration::from_millis(750),
            empty_claims_before_yield: 8,
            idle_backoff: Duration::from_secs(2),
            pause_poll: Duration::from_millis(500),
        }
    }
}

/// Drives one job's crawl. Created per running job, dropped when the job
/// reaches a terminal state.
pub struct Dispatcher {
    store: Store,
    frontier: Frontier,
    robots: Arc<RobotsPolicy>,
    limiters: Arc<RateLimiters>,
    fetcher: Arc<dyn Fetcher>,
    config: DispatcherConfig,
}

struct WorkerContext {
    store: Store,
    frontier: Frontier,
    robots: Arc<RobotsPolicy>,
    limiters: Arc<RateLimiters>,
    fetcher: Arc<dyn Fetcher>,
    config: DispatcherConfig,
    /// Immutable job configuration, snapshotted at dispatch start. Status and
    /// counters are always re-read from the store.
    job: Job,
    filters: JobFilters,
}

impl Dispatcher {
    pub fn new(
        store: Store,
        robots: Arc<RobotsPolicy>,
        limiters: Arc<RateLimiters>,
        fetcher: Arc<dyn Fetcher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            frontier: Frontier::new(store.clone()),
            store,
            robots,
            limiters,
            fetcher,
            config,
        }
    }

    /// Run the worker pool for `job` until every worker has observed a
    /// terminal status and drained.
    pub async fn run(&self, job: Job) {
        let filters = match JobFilters::for_job(&job) {
            Ok(filters) => filters,
            Err(error) => {
                // Patterns were validated at admission; failing here means the
                // stored row is corrupt. Fail the job rather than crawl unfiltered.
                error!("job {}: stored patterns no longer compile: {error}", job.id);
                if let Err(update_error) = self
                    .store
                    .update_job_status(
                        job.id,
                        None,
                        JobStatus::Failed,
                        crate::store::JobPatch {
                            completed_at: Some(Utc::now()),
                            last_error: Some(format!("invalid stored patterns: {error}")),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    error!("job {}: failed to mark failed: {update_error}", job.id);
                }
                return;
            }
        };

        let context = Arc::new(WorkerContext {
            store: self.store.clone(),
            frontier: self.frontier.clone(),
            robots: self.robots.clone(),
            limiters: self.limiters.clone(),
            fetcher: self.fetcher.clone(),
            config: self.config.clone(),
            job,
            filters,
        });

        let mut workers = JoinSet::new();
        for worker_id in 0..context.job.max_workers {
            let context = context.clone();
            workers.spawn(worker_loop(context, worker_id));
        }
        while let Some(result) = workers.join_next().await {
            if let Err(error) = result {
                error!("job {}: worker task panicked: {error}", context.job.id);
            }
        }
        debug!("job {}: dispatcher drained", context.job.id);
    }
}

async fn worker_loop(context: Arc<WorkerContext>, worker_id: usize) {
    let job_id = context.job.id;
    let mut empty_claims = 0u32;

    loop {
        // Re-read the job so pause/cancel and counter movement are observed.
        let job = match context.store.get_job(job_id).await {
            Ok(job) => job,
            Err(StoreError::JobNotFound(_)) => break,
            Err(error) => {
                warn!("worker {worker_id} of job {job_id}: job read failed: {error}");
                tokio::time::sleep(context.config.idle_backoff).await;
                continue;
            }
        };
        match job.status {
            JobStatus::Running => {}
            JobStatus::Paused => {
                tokio::time::sleep(context.config.pause_poll).await;
                continue;
            }
            _ => break,
        }

        // Budget short-circuit: everything still pending is dropped as skipped.
        if job.crawled >= job.max_pages {
            match context.store.skip_remaining_pending(job_id).await {
                Ok(0) => {}
                Ok(skipped) => {
                    if let Err(error) = context
                        .store
                        .increment_counter(job_id, CounterField::Skipped, skipped as i64)
                        .await
                    {
                        warn!("job {job_id}: skipped counter update failed: {error}");
                    }
                    debug!("job {job_id}: page budget reached, skipped {skipped} pending entries");
                }
                Err(error) => warn!("job {job_id}: budget skip failed: {error}"),
            }
            break;
        }

        let claimed = match context.frontier.claim(job_id, 1).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!("worker {worker_id} of job {job_id}: claim failed: {error}");
                tokio::time::sleep(context.config.idle_backoff).await;
                continue;
            }
        };
        let Some(entry) = claimed.into_iter().next() else {
            empty_claims += 1;
            let backoff = if empty_claims >= context.config.empty_claims_before_yield {
                context.config.idle_backoff
            } else {
                claim_jitter(&context.config)
            };
            tokio::time::sleep(backoff).await;
            continue;
        };
        empty_claims = 0;

        if let Err(error) = process_entry(&context, &job, &entry).await {
            error!(
                "worker {worker_id} of job {job_id}: processing {} failed: {error}",
                entry.url
            );
            if let Err(record_error) = context
                .store
                .record_job_error(job_id, &error.to_string())
                .await
            {
                warn!("job {job_id}: failed to record error: {record_error}");
            }
        }
    }
    debug!("worker {worker_id} of job {job_id} exiting");
}

fn claim_jitter(config: &DispatcherConfig) -> Duration {
    let min = config.claim_backoff_min.as_millis() as u64;
    let max = config.claim_backoff_max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min)))
}

async fn process_entry(
    context: &WorkerContext,
    job: &Job,
    entry: &FrontierEntry,
) -> Result<(), StoreError> {
    let labels = [("job", job.id.to_string())];

    if job.respect_robots && !context.robots.is_allowed(&entry.url, &job.domain).await {
        context.frontier.skip(entry.id).await?;
        context
            .store
            .update_page(job.id, &entry.normalized_url, PageStatus::Skipped, PagePatch::default())
            .await?;
        context
            .store
            .increment_counter(job.id, CounterField::Skipped, 1)
            .await?;
        metrics::counter!("crawl_pages_skipped_total", &labels).increment(1);
        debug!("job {}: robots disallows {}", job.id, entry.url);
        return Ok(());
    }

    let domain = normalize::host_of(&entry.url).unwrap_or_else(|| job.domain.clone());
    let limiter = context.limiters.for_domain(
        job.id,
        &domain,
        Duration::from_millis(job.crawl_delay_ms),
    );
    if job.respect_robots {
        if let Some(declared) = context.robots.crawl_delay(&job.domain).await {
            if declared > limiter.delay() {
                limiter.set_delay(declared);
            }
        }
    }
    limiter.acquire().await;

    let started = tokio::time::Instant::now();
    let result = context.fetcher.fetch(&entry.url).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    match result {
        Ok(page) => {
            handle_fetched(context, job, entry, page, duration_ms).await?;
            metrics::counter!("crawl_pages_completed_total", &labels).increment(1);
        }
        Err(FetchError::Retryable {
            message,
            status,
            retry_after,
        }) => {
            if let Some(status) = status {
                if is_throttle_status(status) {
                    limiter.throttle(retry_after.unwrap_or(context.config.throttle_default));
                }
            }
            handle_retryable(context, job, entry, &message, status, retry_after).await?;
        }
        Err(FetchError::Fatal { message, status }) => {
            handle_failed(context, job, entry, &message, status).await?;
            metrics::counter!("crawl_pages_failed_total", &labels).increment(1);
        }
    }
    Ok(())
}

async fn handle_fetched(
    context: &WorkerContext,
    job: &Job,
    entry: &FrontierEntry,
    page: FetchedPage,
    duration_ms: i64,
) -> Result<(), StoreError> {
    let (links, metadata) = if page.is_html() {
        (
            extract::extract_links(&page.body, &page.final_url),
            extract::extract_metadata(&page.body),
        )
    } else {
        (Vec::new(), extract::PageMetadata::default())
    };

    context
        .store
        .update_page(
            job.id,
            &entry.normalized_url,
            PageStatus::Completed,
            PagePatch {
                http_status: Some(i64::from(page.http_status)),
                content_type: page.content_type.clone(),
                content_length: Some(page.body.len() as i64),
                title: metadata.title,
                description: metadata.description,
                content: Some(truncate_content(&page.body, MAX_CONTENT_CHARS)),
                links_found: Some(links.len() as i64),
                crawled_at: Some(Utc::now()),
                duration_ms: Some(duration_ms),
                ..Default::default()
            },
        )
        .await?;

    // Discover before releasing the claim: the entry stays `claimed` until
    // its children are enqueued, so the completion detector can never observe
    // a transient all-zero frontier mid-handoff.
    if entry.depth < i64::from(job.max_depth) && !links.is_empty() {
        let discovered = context
            .frontier
            .discover(job, &context.filters, entry.depth, &links)
            .await?;
        if discovered > 0 {
            context
                .store
                .increment_counter(job.id, CounterField::Discovered, discovered as i64)
                .await?;
            metrics::counter!("crawl_urls_discovered_total", &[("job", job.id.to_string())])
                .increment(discovered);
        }
    }

    context.frontier.complete(entry.id).await?;
    context
        .store
        .increment_counter(job.id, CounterField::Crawled, 1)
        .await?;
    Ok(())
}

async fn handle_retryable(
    context: &WorkerContext,
    job: &Job,
    entry: &FrontierEntry,
    message: &str,
    status: Option<u16>,
    retry_after: Option<Duration>,
) -> Result<(), StoreError> {
    let retry_count = entry.retry_count + 1;
    if (retry_count as u32) < context.config.retry_policy.max_retries() {
        let backoff = context
            .config
            .retry_policy
            .retry_interval(entry.retry_count as u32, retry_after);
        let not_before = Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(60));
        context
            .frontier
            .retry_later(entry.id, retry_count, not_before)
            .await?;
        context
            .store
            .update_page(
                job.id,
                &entry.normalized_url,
                PageStatus::Pending,
                PagePatch {
                    http_status: status.map(i64::from),
                    error_message: Some(message.to_owned()),
                    retry_count: Some(retry_count),
                    ..Default::default()
                },
            )
            .await?;
        metrics::counter!("crawl_pages_retried_total", &[("job", job.id.to_string())])
            .increment(1);
        debug!(
            "job {}: retrying {} (attempt {retry_count}) after {message}",
            job.id, entry.url
        );
        Ok(())
    } else {
        handle_failed(context, job, entry, message, status).await?;
        metrics::counter!("crawl_pages_failed_total", &[("job", job.id.to_string())]).increment(1);
        Ok(())
    }
}

async fn handle_failed(
    context: &WorkerContext,
    job: &Job,
    entry: &FrontierEntry,
    message: &str,
    status: Option<u16>,
) -> Result<(), StoreError> {
    context
        .frontier
        .exhaust(entry.id, entry.retry_count + 1)
        .await?;
    context
        .store
        .update_page(
            job.id,
            &entry.normalized_url,
            PageStatus::Failed,
            PagePatch {
                http_status: status.map(i64::from),
                error_message: Some(message.to_owned()),
                retry_count: Some(entry.retry_count + 1),
                ..Default::default()
            },
        )
        .await?;
    context
        .store
        .increment_counter(job.id, CounterField::Failed, 1)
        .await?;
    debug!("job {}: {} failed for good: {message}", job.id, entry.url);
    Ok(())
}
