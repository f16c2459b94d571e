//! robots.txt fetching, parsing, and caching.
//!
//! Policy decisions are advisory: the crawler is polite through its rate
//! limiter, so any fetch or parse failure here degrades to *allow*. A denial
//! marks the page skipped, never failed.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use texting_robots::Robot;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::store::{RobotsRecord, Store};

/// How long a fetched robots.txt stays authoritative.
const ROBOTS_TTL_HOURS: i64 = 24;

struct CachedPolicy {
    /// None means no robots.txt exists for the origin: allow everything.
    matcher: Option<Robot>,
    crawl_delay: Option<Duration>,
    expires_at: DateTime<Utc>,
}

/// Per-origin robots.txt policy with a two-tier cache: a process-local map in
/// front of the store's shared records. The store tier is authoritative
/// across processes; the local tier only saves round-trips.
pub struct RobotsPolicy {
    store: Store,
    client: reqwest::Client,
    user_agent: String,
    cache: RwLock<HashMap<String, CachedPolicy>>,
}

impl RobotsPolicy {
    pub fn new(store: Store, user_agent: &str, fetch_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_owned())
            .timeout(fetch_timeout)
            .build()
            .expect("failed to construct reqwest client for robots policy");

        Self {
            store,
            client,
            user_agent: user_agent.to_owned(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-populate the caches for a domain; called when a job is created so
    /// the first worker doesn't pay the fetch.
    pub async fn warm(&self, domain: &str) {
        self.ensure(domain).await;
    }

    /// Whether the configured User-Agent may fetch `url` on `domain`.
    pub async fn is_allowed(&self, url: &str, domain: &str) -> bool {
        self.ensure(domain).await;
        let cache = self.cache.read().await;
        match cache.get(domain) {
            Some(policy) => policy
                .matcher
                .as_ref()
                .map(|matcher| matcher.allowed(url))
                .unwrap_or(true),
            None => true,
        }
    }

    /// The origin's declared Crawl-delay, when present.
    pub async fn crawl_delay(&self, domain: &str) -> Option<Duration> {
        self.ensure(domain).await;
        let cache = self.cache.read().await;
        cache.get(domain).and_then(|policy| policy.crawl_delay)
    }

    /// Make sure a fresh policy for `domain` sits in the local cache,
    /// consulting the store first and fetching only on a full miss.
    async fn ensure(&self, domain: &str) {
        {
            let cache = self.cache.read().await;
            if let Some(policy) = cache.get(domain) {
                if policy.expires_at > Utc::now() {
                    return;
                }
            }
        }

        let record = match self.store.get_robots(domain).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                let record = self.fetch_record(domain).await;
                if let Err(error) = self.store.upsert_robots(&record).await {
                    warn!("failed to persist robots.txt for {domain}: {error}");
                }
                record
            }
            Err(error) => {
                warn!("robots lookup failed for {domain}, allowing: {error}");
                // Leave the store alone and cache an allow-all until the next
                // expiry so we don't hammer a broken store.
                RobotsRecord {
                    domain: domain.to_owned(),
                    body: None,
                    crawl_delay_secs: None,
                    fetched_at: Utc::now(),
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                }
            }
        };

        let policy = self.compile(&record);
        self.cache.write().await.insert(domain.to_owned(), policy);
    }

    fn compile(&self, record: &RobotsRecord) -> CachedPolicy {
        let matcher = record
            .body
            .as_deref()
            .and_then(|body| Robot::new(&self.user_agent, body.as_bytes()).ok());
        let crawl_delay = matcher
            .as_ref()
            .and_then(|robot| robot.delay)
            .map(|seconds| Duration::from_secs_f32(seconds))
            .or_else(|| record.crawl_delay_secs.map(Duration::from_secs_f64));

        CachedPolicy {
            matcher,
            crawl_delay,
            expires_at: record.expires_at,
        }
    }

    /// GET the origin's robots.txt, https first with one http fallback.
    /// 404 or a double failure yields a null record: allow everything.
    async fn fetch_record(&self, domain: &str) -> RobotsRecord {
        let mut body = None;
        for scheme in ["https", "http"] {
            match self.fetch_body(&format!("{scheme}://{domain}/robots.txt")).await {
                Some(text) => {
                    body = Some(text);
                    break;
                }
                None => debug!("no robots.txt via {scheme} for {domain}"),
            }
        }

        let crawl_delay_secs = body
            .as_deref()
            .and_then(|text| Robot::new(&self.user_agent, text.as_bytes()).ok())
            .and_then(|robot| robot.delay)
            .map(f64::from);

        let now = Utc::now();
        RobotsRecord {
            domain: domain.to_owned(),
            body,
            crawl_delay_secs,
            fetched_at: now,
            expires_at: now + chrono::Duration::hours(ROBOTS_TTL_HOURS),
        }
    }

    async fn fetch_body(&self, url: &str) -> Option<String> {
        let response = self.client.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.text().await.ok()
    }
}
