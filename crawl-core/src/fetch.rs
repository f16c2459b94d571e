use std::time;

use async_trait::async_trait;
use http::StatusCode;

use crate::error::FetchError;

/// A successfully fetched page, body included. Truncation for storage happens
/// at persistence time, not here; link extraction wants the full body.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// The URL the response came from, after redirects.
    pub final_url: String,
    pub http_status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedPage {
    /// Whether the body is worth handing to the HTML extractor.
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|content_type| content_type.contains("text/html"))
            .unwrap_or(false)
    }
}

/// The page-fetching seam. The dispatcher only depends on this trait, so a
/// headless-browser implementation (or a scripted one in tests) can stand in
/// for the plain HTTP client.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Production fetcher backed by reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, request_timeout: time::Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_owned())
            .timeout(request_timeout)
            .build()
            .map_err(|error| FetchError::Fatal {
                message: format!("failed to construct http client: {error}"),
                status: None,
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| FetchError::Retryable {
                message: error.to_string(),
                status: None,
                retry_after: None,
            })?;

        let status = response.status();
        let retry_after = parse_retry_after_header(response.headers());
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_owned());

        if status.is_success() {
            let body = response.text().await.map_err(|error| FetchError::Retryable {
                message: format!("failed to read response body: {error}"),
                status: Some(status.as_u16()),
                retry_after: None,
            })?;
            return Ok(FetchedPage {
                final_url,
                http_status: status.as_u16(),
                content_type,
                body,
            });
        }

        if is_retryable_status(status) {
            Err(FetchError::Retryable {
                message: format!("server responded with {status}"),
                status: Some(status.as_u16()),
                retry_after,
            })
        } else {
            Err(FetchError::Fatal {
                message: format!("server responded with {status}"),
                status: Some(status.as_u16()),
            })
        }
    }
}

/// A failing request is worth retrying when the status indicates trying again
/// later could resolve the issue: 429 and any 5xx.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Statuses that additionally open a throttle window on the origin's limiter.
pub fn is_throttle_status(status: u16) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS.as_u16()
        || status == StatusCode::SERVICE_UNAVAILABLE.as_u16()
}

/// Attempt to parse a Duration from a Retry-After header, returning None if not possible.
/// Retry-After can specify a number of seconds or an HTTP-date; we try both.
fn parse_retry_after_header(header_map: &reqwest::header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?;

    if let Ok(seconds) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(seconds));
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let duration = chrono::DateTime::<chrono::Utc>::from(date) - chrono::Utc::now();

        // This can only fail when negative, in which case we return None.
        return duration.to_std().ok();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn throttle_statuses_are_the_courtesy_pair() {
        assert!(is_throttle_status(429));
        assert!(is_throttle_status(503));
        assert!(!is_throttle_status(500));
        assert!(!is_throttle_status(200));
    }

    #[test]
    fn parse_retry_after_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(
            parse_retry_after_header(&headers),
            Some(time::Duration::from_secs(120))
        );
    }

    #[test]
    fn parse_retry_after_absent_or_stale() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_retry_after_header(&headers), None);

        // A date in the past yields no duration.
        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after_header(&headers), None);
    }

    #[test]
    fn parse_retry_after_future_date() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(90);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::RETRY_AFTER,
            future.to_rfc2822().parse().unwrap(),
        );
        let parsed = parse_retry_after_header(&headers).unwrap();
        assert!(parsed <= time::Duration::from_secs(90));
        assert!(parsed >= time::Duration::from_secs(80));
    }

    #[test]
    fn html_detection_uses_content_type() {
        let page = FetchedPage {
            final_url: "https://a.test/".to_owned(),
            http_status: 200,
            content_type: Some("text/html; charset=utf-8".to_owned()),
            body: String::new(),
        };
        assert!(page.is_html());

        let page = FetchedPage {
            content_type: Some("application/pdf".to_owned()),
            ..page
        };
        assert!(!page.is_html());

        let page = FetchedPage {
            content_type: None,
            ..page
        };
        assert!(!page.is_html());
    }
}
