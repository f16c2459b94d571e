use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3400")]
    pub port: u16,

    #[envconfig(from = "DATABASE_URL", default = "sqlite:crawl.db")]
    pub database_url: String,

    #[envconfig(from = "USER_AGENT", default = "crawl-server/0.1")]
    pub user_agent: String,

    #[envconfig(from = "REQUEST_TIMEOUT_MS", default = "30000")]
    pub request_timeout: Millis,

    #[envconfig(from = "ROBOTS_TIMEOUT_MS", default = "10000")]
    pub robots_timeout: Millis,

    #[envconfig(from = "DETECTOR_INTERVAL_MS", default = "10000")]
    pub detector_interval: Millis,

    #[envconfig(from = "THROTTLE_DEFAULT_MS", default = "60000")]
    pub throttle_default: Millis,

    #[envconfig(from = "MAX_RETRIES", default = "3")]
    pub max_retries: u32,

    #[envconfig(from = "DEFAULT_WORKER_COUNT", default = "10")]
    pub default_workers: usize,

    #[envconfig(from = "DEFAULT_CRAWL_DELAY_MS", default = "1000")]
    pub default_crawl_delay_ms: u64,

    #[envconfig(from = "DEFAULT_MAX_PAGES", default = "100000")]
    pub default_max_pages: i64,
}

/// Job configuration fields the server fills in when a create request omits
/// them. Environment-tunable, semantics-neutral.
#[derive(Debug, Clone, Copy)]
pub struct JobDefaults {
    pub max_workers: usize,
    pub crawl_delay_ms: u64,
    pub max_pages: i64,
}

impl From<&Config> for JobDefaults {
    fn from(config: &Config) -> Self {
        Self {
            max_workers: config.default_workers,
            crawl_delay_ms: config.default_crawl_delay_ms,
            max_pages: config.default_max_pages,
        }
    }
}

/// A crawl timing knob taken from the environment as whole milliseconds,
/// e.g. `REQUEST_TIMEOUT_MS=30000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Millis(time::Duration);

impl Millis {
    pub fn duration(&self) -> time::Duration {
        self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct NotMilliseconds;

impl FromStr for Millis {
    type Err = NotMilliseconds;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().parse::<u64>() {
            Ok(ms) => Ok(Millis(time::Duration::from_millis(ms))),
            Err(_) => Err(NotMilliseconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_knobs_parse_from_millis() {
        assert_eq!(
            "1500".parse::<Millis>().unwrap().duration(),
            time::Duration::from_millis(1500)
        );
        assert_eq!(
            " 250 ".parse::<Millis>().unwrap().duration(),
            time::Duration::from_millis(250)
        );
        assert_eq!("nope".parse::<Millis>(), Err(NotMilliseconds));
        assert_eq!("-5".parse::<Millis>(), Err(NotMilliseconds));
    }
}
