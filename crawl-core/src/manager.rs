//! Job lifecycle: admission, the state machine, the completion detector, and
//! startup recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::CrawlError;
use crate::fetch::Fetcher;
use crate::frontier::Frontier;
use crate::job::{CounterField, Job, JobConfig, JobStatus};
use crate::limiter::RateLimiters;
use crate::robots::RobotsPolicy;
use crate::store::{JobPatch, QueueStats, Store};

#[derive(Clone)]
pub struct ManagerConfig {
    pub dispatcher: DispatcherConfig,
    /// Probe interval of the completion detector. Terminal transitions need
    /// two consecutive zero observations, i.e. at least one full interval of
    /// stable quiet.
    pub detector_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            detector_interval: Duration::from_secs(10),
        }
    }
}

struct JobRuntime {
    dispatcher: JoinHandle<()>,
    detector: JoinHandle<()>,
}

impl JobRuntime {
    fn is_finished(&self) -> bool {
        self.dispatcher.is_finished() && self.detector.is_finished()
    }
}

struct Inner {
    store: Store,
    frontier: Frontier,
    robots: Arc<RobotsPolicy>,
    limiters: Arc<RateLimiters>,
    fetcher: Arc<dyn Fetcher>,
    config: ManagerConfig,
    /// Live runtimes, keyed by job. A job missing here either never started
    /// in this process or has drained.
    active: tokio::sync::Mutex<HashMap<Uuid, JobRuntime>>,
}

/// Owns every job's lifecycle in this process. One process dispatches a given
/// job at a time; ownership is reflected by the job status, and `recover`
/// rebinds anything orphaned by a restart.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(
        store: Store,
        robots: Arc<RobotsPolicy>,
        fetcher: Arc<dyn Fetcher>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                frontier: Frontier::new(store.clone()),
                store,
                robots,
                limiters: Arc::new(RateLimiters::new()),
                fetcher,
                config,
                active: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Validate and persist a new job, then start it in the background.
    /// Returns immediately with the job still `pending`.
    pub async fn create_job(&self, config: JobConfig) -> Result<Job, CrawlError> {
        let domain = config.validate()?;
        let job = self.inner.store.create_job(&config, &domain).await?;
        info!("job {}: created for {} (domain {domain})", job.id, job.seed_url);

        let inner = self.inner.clone();
        let startup = job.clone();
        tokio::spawn(async move {
            start_job(inner, startup).await;
        });
        Ok(job)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, CrawlError> {
        Ok(self.inner.store.get_job(id).await?)
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Job>, i64), CrawlError> {
        Ok(self.inner.store.list_jobs(status, limit, offset).await?)
    }

    /// The job plus its live frontier stats, for API projections.
    pub async fn job_view(&self, id: Uuid) -> Result<(Job, QueueStats), CrawlError> {
        let job = self.inner.store.get_job(id).await?;
        let stats = self.inner.store.queue_stats(id).await?;
        Ok((job, stats))
    }

    /// Halt dispatching at the next worker loop head. In-flight fetches
    /// complete and persist before their workers park.
    pub async fn pause_job(&self, id: Uuid) -> Result<Job, CrawlError> {
        let job = self.inner.store.get_job(id).await?;
        if job.status != JobStatus::Running {
            return Err(CrawlError::InvalidTransition {
                id,
                status: job.status.to_string(),
                action: "paused",
            });
        }
        let moved = self
            .inner
            .store
            .update_job_status(id, Some(JobStatus::Running), JobStatus::Paused, JobPatch::default())
            .await?;
        if !moved {
            // Lost the race against a terminal transition.
            let job = self.inner.store.get_job(id).await?;
            return Err(CrawlError::InvalidTransition {
                id,
                status: job.status.to_string(),
                action: "paused",
            });
        }
        info!("job {id}: paused");
        Ok(self.inner.store.get_job(id).await?)
    }

    pub async fn resume_job(&self, id: Uuid) -> Result<Job, CrawlError> {
        let job = self.inner.store.get_job(id).await?;
        if job.status != JobStatus::Paused {
            return Err(CrawlError::InvalidTransition {
                id,
                status: job.status.to_string(),
                action: "resumed",
            });
        }
        let moved = self
            .inner
            .store
            .update_job_status(id, Some(JobStatus::Paused), JobStatus::Running, JobPatch::default())
            .await?;
        if !moved {
            let job = self.inner.store.get_job(id).await?;
            return Err(CrawlError::InvalidTransition {
                id,
                status: job.status.to_string(),
                action: "resumed",
            });
        }

        // After a restart a paused job has no runtime; rebind one.
        let job = self.inner.store.get_job(id).await?;
        ensure_runtime(&self.inner, &job).await;
        info!("job {id}: resumed");
        Ok(job)
    }

    /// Record the cancel intent and clear the frontier. Returns as soon as
    /// the status is written; workers observe it and drain on their own.
    pub async fn cancel_job(&self, id: Uuid) -> Result<Job, CrawlError> {
        loop {
            let job = self.inner.store.get_job(id).await?;
            if job.status.is_terminal() {
                return Err(CrawlError::InvalidTransition {
                    id,
                    status: job.status.to_string(),
                    action: "cancelled",
                });
            }
            let moved = self
                .inner
                .store
                .update_job_status(
                    id,
                    Some(job.status),
                    JobStatus::Cancelled,
                    JobPatch {
                        completed_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await?;
            if moved {
                break;
            }
            // Lost a race with another transition; re-read and retry.
        }

        self.inner.frontier.clear(id).await?;
        self.inner.limiters.remove_job(id);
        info!("job {id}: cancelled");
        Ok(self.inner.store.get_job(id).await?)
    }

    /// Rebind every job orphaned in `running` (or never-started `pending`)
    /// state by a process restart: claims are returned to the pending pool
    /// and a fresh runtime is attached. Returns the number of jobs rebound.
    pub async fn recover(&self) -> Result<usize, CrawlError> {
        let jobs = self.inner.store.resumable_jobs().await?;
        let mut rebound = 0;
        for job in jobs {
            let orphaned = self.inner.store.reset_claimed(job.id).await?;
            if orphaned > 0 {
                info!("job {}: returned {orphaned} orphaned claims to pending", job.id);
            }
            match job.status {
                JobStatus::Pending => {
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        start_job(inner, job).await;
                    });
                }
                JobStatus::Running => {
                    ensure_runtime(&self.inner, &job).await;
                }
                _ => continue,
            }
            rebound += 1;
        }
        if rebound > 0 {
            info!("recovered {rebound} job(s) after restart");
        }
        Ok(rebound)
    }
}

/// Warm the robots cache, seed the frontier, and move the job to `running`.
/// Any store failure here is job-level-fatal.
async fn start_job(inner: Arc<Inner>, job: Job) {
    if job.respect_robots {
        inner.robots.warm(&job.domain).await;
    }

    match inner.frontier.seed(job.id, &job.seed_url).await {
        Ok(0) => {}
        Ok(delta) => {
            if let Err(error) = inner
                .store
                .increment_counter(job.id, CounterField::Discovered, delta as i64)
                .await
            {
                warn!("job {}: discovered counter update failed: {error}", job.id);
            }
        }
        Err(error) => {
            error!("job {}: seeding failed: {error}", job.id);
            if let Err(update_error) = inner
                .store
                .update_job_status(
                    job.id,
                    None,
                    JobStatus::Failed,
                    JobPatch {
                        completed_at: Some(Utc::now()),
                        last_error: Some(format!("seeding failed: {error}")),
                        ..Default::default()
                    },
                )
                .await
            {
                error!("job {}: failed to mark failed: {update_error}", job.id);
            }
            return;
        }
    }

    let moved = match inner
        .store
        .update_job_status(
            job.id,
            Some(JobStatus::Pending),
            JobStatus::Running,
            JobPatch {
                started_at: Some(Utc::now()),
                ..Default::default()
            },
        )
        .await
    {
        Ok(moved) => moved,
        Err(error) => {
            error!("job {}: failed to mark running: {error}", job.id);
            return;
        }
    };
    if !moved {
        // Cancelled before startup finished; sweep anything seeded above.
        if let Err(error) = inner.frontier.clear(job.id).await {
            warn!("job {}: post-cancel frontier sweep failed: {error}", job.id);
        }
        return;
    }

    match inner.store.get_job(job.id).await {
        Ok(job) => ensure_runtime(&inner, &job).await,
        Err(error) => error!("job {}: re-read after start failed: {error}", job.id),
    }
}

/// Attach a dispatcher and completion detector to the job unless a live
/// runtime already exists.
async fn ensure_runtime(inner: &Arc<Inner>, job: &Job) {
    let mut active = inner.active.lock().await;
    if let Some(runtime) = active.get(&job.id) {
        if !runtime.is_finished() {
            return;
        }
    }

    let dispatcher = Dispatcher::new(
        inner.store.clone(),
        inner.robots.clone(),
        inner.limiters.clone(),
        inner.fetcher.clone(),
        inner.config.dispatcher.clone(),
    );
    let dispatch_job = job.clone();
    let dispatcher = tokio::spawn(async move {
        dispatcher.run(dispatch_job).await;
    });

    let detector_inner = inner.clone();
    let job_id = job.id;
    let detector = tokio::spawn(async move {
        detector_loop(detector_inner, job_id).await;
    });

    active.insert(
        job.id,
        JobRuntime {
            dispatcher,
            detector,
        },
    );
}

/// Periodic completion probe. Because claim, process, and discover are not
/// atomic across components, a terminal transition is only committed after
/// two consecutive zero observations separated by a full interval.
async fn detector_loop(inner: Arc<Inner>, job_id: Uuid) {
    let mut interval = tokio::time::interval(inner.config.detector_interval);
    let mut zero_streak = 0u32;

    loop {
        interval.tick().await;

        let job = match inner.store.get_job(job_id).await {
            Ok(job) => job,
            Err(error) => {
                warn!("detector for job {job_id}: read failed: {error}");
                break;
            }
        };
        match job.status {
            JobStatus::Running => {}
            JobStatus::Paused => {
                zero_streak = 0;
                continue;
            }
            _ => break,
        }

        if job.crawled >= job.max_pages {
            match inner.store.skip_remaining_pending(job_id).await {
                Ok(skipped) if skipped > 0 => {
                    if let Err(error) = inner
                        .store
                        .increment_counter(job_id, CounterField::Skipped, skipped as i64)
                        .await
                    {
                        warn!("detector for job {job_id}: skipped counter update failed: {error}");
                    }
                }
                Ok(_) => {}
                Err(error) => warn!("detector for job {job_id}: budget skip failed: {error}"),
            }
            finish_job(&inner, &job, JobStatus::Completed, None).await;
            break;
        }

        let stats = match inner.store.queue_stats(job_id).await {
            Ok(stats) => stats,
            Err(error) => {
                warn!("detector for job {job_id}: stats read failed: {error}");
                continue;
            }
        };

        if stats.pending == 0 && stats.claimed == 0 {
            zero_streak += 1;
            if zero_streak >= 2 {
                let (status, last_error) = if job.crawled >= 1 || job.failed == 0 {
                    (JobStatus::Completed, None)
                } else {
                    (
                        JobStatus::Failed,
                        Some("every attempted page failed".to_owned()),
                    )
                };
                finish_job(&inner, &job, status, last_error).await;
                break;
            }
        } else {
            zero_streak = 0;
        }
    }

    inner.active.lock().await.remove(&job_id);
}

async fn finish_job(inner: &Arc<Inner>, job: &Job, status: JobStatus, last_error: Option<String>) {
    let moved = inner
        .store
        .update_job_status(
            job.id,
            Some(JobStatus::Running),
            status,
            JobPatch {
                completed_at: Some(Utc::now()),
                last_error,
                ..Default::default()
            },
        )
        .await;
    match moved {
        Ok(true) => info!(
            "job {}: {status} (crawled {} failed {} skipped {} of {} discovered)",
            job.id, job.crawled, job.failed, job.skipped, job.discovered
        ),
        Ok(false) => {
            // Someone else (pause or cancel) won the race; leave it to them.
        }
        Err(error) => error!("job {}: terminal transition failed: {error}", job.id),
    }
    inner.limiters.remove_job(job.id);
}
