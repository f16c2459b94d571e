//! Core engine for a durable, resumable, polite web crawler.
//!
//! A crawl job explores a single authoritative domain (plus subdomains) from a
//! seed URL, bounded by depth and page budgets. Every discovered URL and every
//! fetched page is persisted, so a job survives process restarts and can be
//! paused, resumed, or cancelled without losing work or re-crawling pages.
//!
//! The pieces, leaves first: [`store::Store`] owns all durable state,
//! [`robots::RobotsPolicy`] caches per-origin robots.txt decisions,
//! [`limiter::RateLimiters`] paces requests per origin, [`frontier::Frontier`]
//! deduplicates and hands out URLs, [`dispatcher::Dispatcher`] drives the
//! worker pool, and [`manager::JobManager`] owns the job lifecycle.

pub mod dispatcher;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod frontier;
pub mod job;
pub mod limiter;
pub mod manager;
pub mod normalize;
pub mod page;
pub mod retry;
pub mod robots;
pub mod store;
