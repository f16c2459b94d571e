//! Per-origin request pacing.
//!
//! One limiter exists per `(job, domain)` pair. Workers block in `acquire`
//! until the origin's next slot opens, so no two fetches against the same
//! origin ever overlap regardless of worker count, and raising dispatcher
//! concurrency never collapses into bursts against one host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

/// Pacing state for a single origin.
///
/// The gate is a fair async mutex: waiters are queued and released strictly in
/// acquisition order, making the limiter a single-serving token bus rather
/// than a pool. Throttle windows and delay changes go through atomics so they
/// take effect immediately, without joining the queue.
pub struct DomainLimiter {
    /// Fair FIFO gate guarding the last-request stamp. Held across the wait.
    gate: tokio::sync::Mutex<Option<Instant>>,
    delay_ms: AtomicU64,
    /// Millis since `base` until which no waiter may be released; 0 = none.
    throttle_until_ms: AtomicU64,
    base: Instant,
}

impl DomainLimiter {
    fn new(delay: Duration, base: Instant) -> Self {
        Self {
            gate: tokio::sync::Mutex::new(None),
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
            throttle_until_ms: AtomicU64::new(0),
            base,
        }
    }

    /// Block until `now >= max(last_request + delay, throttle_until)`, then
    /// take the slot. The head waiter re-checks after every sleep, so a
    /// throttle arriving while it sleeps extends its wait.
    pub async fn acquire(&self) {
        let mut last_request = self.gate.lock().await;
        loop {
            let now = Instant::now();
            let delay = Duration::from_millis(self.delay_ms.load(Ordering::Relaxed));
            let mut ready_at = match *last_request {
                Some(at) => at + delay,
                None => now,
            };
            if let Some(until) = self.throttle_deadline() {
                ready_at = ready_at.max(until);
            }
            if now >= ready_at {
                *last_request = Some(now);
                return;
            }
            tokio::time::sleep_until(ready_at).await;
        }
    }

    /// Extend the throttle window to at least `duration` from now. Never
    /// shortens an existing window.
    pub fn throttle(&self, duration: Duration) {
        let until_ms = (Instant::now() + duration)
            .duration_since(self.base)
            .as_millis() as u64;
        self.throttle_until_ms.fetch_max(until_ms, Ordering::AcqRel);
    }

    /// Change the inter-request delay; applies to subsequent waits.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.load(Ordering::Relaxed))
    }

    fn throttle_deadline(&self) -> Option<Instant> {
        let until_ms = self.throttle_until_ms.load(Ordering::Acquire);
        if until_ms == 0 {
            None
        } else {
            Some(self.base + Duration::from_millis(until_ms))
        }
    }
}

/// Registry of limiters keyed by `(job, domain)`, created lazily. Two jobs
/// crawling the same origin deliberately do not share a limiter.
pub struct RateLimiters {
    limiters: std::sync::Mutex<HashMap<(Uuid, String), Arc<DomainLimiter>>>,
    base: Instant,
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiters {
    pub fn new() -> Self {
        Self {
            limiters: std::sync::Mutex::new(HashMap::new()),
            base: Instant::now(),
        }
    }

    /// The limiter for this job and domain, created with `default_delay` on
    /// first use.
    pub fn for_domain(
        &self,
        job_id: Uuid,
        domain: &str,
        default_delay: Duration,
    ) -> Arc<DomainLimiter> {
        let mut limiters = self.limiters.lock().expect("poisoned limiter registry");
        limiters
            .entry((job_id, domain.to_owned()))
            .or_insert_with(|| Arc::new(DomainLimiter::new(default_delay, self.base)))
            .clone()
    }

    /// Drop every limiter belonging to a job; called when it reaches a
    /// terminal state.
    pub fn remove_job(&self, job_id: Uuid) {
        let mut limiters = self.limiters.lock().expect("poisoned limiter registry");
        limiters.retain(|(job, _), _| *job != job_id);
    }

    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        self.limiters.lock().expect("poisoned limiter registry").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_paces_consecutive_requests() {
        let limiter = DomainLimiter::new(Duration::from_millis(50), Instant::now());
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        // Two inter-request gaps of 50ms each.
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn waiters_are_released_in_acquisition_order() {
        let limiter = Arc::new(DomainLimiter::new(Duration::from_millis(30), Instant::now()));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for waiter in 0..4 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                order.lock().unwrap().push(waiter);
            }));
            // Stagger arrivals so acquisition order is deterministic.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn throttle_blocks_until_the_window_closes() {
        let limiter = DomainLimiter::new(Duration::from_millis(1), Instant::now());
        limiter.acquire().await;
        limiter.throttle(Duration::from_millis(80));

        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(75));
    }

    #[tokio::test]
    async fn throttle_never_shrinks_the_window() {
        let limiter = DomainLimiter::new(Duration::from_millis(1), Instant::now());
        limiter.acquire().await;
        limiter.throttle(Duration::from_millis(80));
        limiter.throttle(Duration::from_millis(5));

        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(75));
    }

    #[tokio::test]
    async fn set_delay_applies_to_subsequent_waits() {
        let limiter = DomainLimiter::new(Duration::from_millis(5), Instant::now());
        limiter.acquire().await;
        limiter.set_delay(Duration::from_millis(60));

        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(55));
        assert_eq!(limiter.delay(), Duration::from_millis(60));
    }

    #[tokio::test]
    async fn registry_keys_by_job_and_domain() {
        let registry = RateLimiters::new();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();
        let delay = Duration::from_millis(100);

        let first = registry.for_domain(job_a, "a.test", delay);
        let again = registry.for_domain(job_a, "a.test", delay);
        assert!(Arc::ptr_eq(&first, &again));

        let other_job = registry.for_domain(job_b, "a.test", delay);
        assert!(!Arc::ptr_eq(&first, &other_job));
        assert_eq!(registry.tracked_count(), 2);

        registry.remove_job(job_a);
        assert_eq!(registry.tracked_count(), 1);
    }
}
