use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde_derive::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crawl_core::error::{CrawlError, StoreError};
use crawl_core::job::{Job, JobConfig, JobStatus};
use crawl_core::store::QueueStats;

use super::AppState;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub(crate) fn bad_request(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

pub(crate) fn not_found(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

pub(crate) fn internal_error<E>(err: E) -> (StatusCode, Json<ErrorResponse>)
where
    E: std::error::Error,
{
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub(crate) fn map_crawl_error(error: CrawlError) -> (StatusCode, Json<ErrorResponse>) {
    match &error {
        CrawlError::Store(StoreError::JobNotFound(_))
        | CrawlError::Store(StoreError::PageNotFound(_)) => not_found(&error.to_string()),
        _ if error.is_validation() => bad_request(&error.to_string()),
        _ => internal_error(error),
    }
}

pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid, (StatusCode, Json<ErrorResponse>)> {
    Uuid::parse_str(raw).map_err(|_| bad_request(&format!("{raw} is not a valid {what} id")))
}

/// The body of a request made to create a crawl job. Omitted fields fall back
/// to server-level defaults; out-of-range values are rejected with a 400.
#[derive(Deserialize, Debug)]
pub struct CreateJobRequest {
    seed_url: String,
    max_depth: Option<u32>,
    max_pages: Option<i64>,
    max_concurrent_workers: Option<usize>,
    crawl_delay_ms: Option<u64>,
    respect_robots_txt: Option<bool>,
    #[serde(default)]
    include_patterns: Vec<String>,
    #[serde(default)]
    exclude_patterns: Vec<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<Job>), (StatusCode, Json<ErrorResponse>)> {
    let mut config = JobConfig::new(&payload.seed_url);
    config.max_pages = payload.max_pages.unwrap_or(state.defaults.max_pages);
    config.max_workers = payload
        .max_concurrent_workers
        .unwrap_or(state.defaults.max_workers);
    config.crawl_delay_ms = payload
        .crawl_delay_ms
        .unwrap_or(state.defaults.crawl_delay_ms);
    if let Some(max_depth) = payload.max_depth {
        config.max_depth = max_depth;
    }
    if let Some(respect_robots) = payload.respect_robots_txt {
        config.respect_robots = respect_robots;
    }
    config.include_patterns = payload.include_patterns;
    config.exclude_patterns = payload.exclude_patterns;

    let job = state
        .manager
        .create_job(config)
        .await
        .map_err(map_crawl_error)?;
    // Accepted: the crawl starts in the background.
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Deserialize, Debug)]
pub struct ListJobsQuery {
    page: Option<i64>,
    limit: Option<i64>,
    status: Option<String>,
}

#[derive(Serialize)]
pub struct JobListResponse {
    jobs: Vec<Job>,
    total: i64,
    page: i64,
    limit: i64,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(20);
    if page < 1 {
        return Err(bad_request("page must be at least 1"));
    }
    if !(1..=100).contains(&limit) {
        return Err(bad_request("limit must be between 1 and 100"));
    }
    let status = match &query.status {
        Some(raw) => Some(
            raw.parse::<JobStatus>()
                .map_err(|_| bad_request(&format!("{raw} is not a valid job status")))?,
        ),
        None => None,
    };

    let (jobs, total) = state
        .manager
        .list_jobs(status, limit, (page - 1) * limit)
        .await
        .map_err(map_crawl_error)?;
    Ok(Json(JobListResponse {
        jobs,
        total,
        page,
        limit,
    }))
}

#[derive(Serialize)]
pub struct JobDetailResponse {
    #[serde(flatten)]
    job: Job,
    queue: QueueStats,
    /// Pages per second since the job started.
    crawl_rate: Option<f64>,
    /// Projected seconds until the frontier or the budget runs out.
    eta_seconds: Option<f64>,
}

pub async fn get(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobDetailResponse>, (StatusCode, Json<ErrorResponse>)> {
    let job_id = parse_id(&job_id, "job")?;
    let (job, queue) = state
        .manager
        .job_view(job_id)
        .await
        .map_err(map_crawl_error)?;

    let crawl_rate = job.crawl_rate();
    let eta_seconds = job.eta_seconds(queue.pending);
    Ok(Json(JobDetailResponse {
        job,
        queue,
        crawl_rate,
        eta_seconds,
    }))
}

pub async fn pause(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, (StatusCode, Json<ErrorResponse>)> {
    let job_id = parse_id(&job_id, "job")?;
    let job = state
        .manager
        .pause_job(job_id)
        .await
        .map_err(map_crawl_error)?;
    Ok(Json(job))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, (StatusCode, Json<ErrorResponse>)> {
    let job_id = parse_id(&job_id, "job")?;
    let job = state
        .manager
        .resume_job(job_id)
        .await
        .map_err(map_crawl_error)?;
    Ok(Json(job))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, (StatusCode, Json<ErrorResponse>)> {
    let job_id = parse_id(&job_id, "job")?;
    let job = state
        .manager
        .cancel_job(job_id)
        .await
        .map_err(map_crawl_error)?;
    Ok(Json(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_util::{test_app, test_state};
    use axum::body::Body;
    use axum::http::{self, Request};
    use http_body_util::BodyExt; // for `collect`
    use tower::ServiceExt; // for `oneshot`

    fn create_request(body: &str) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri("/api/v1/jobs")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    #[tokio::test]
    async fn create_job_is_accepted_with_defaults() {
        let app = test_app(test_state().await);

        let response = app
            .oneshot(create_request(
                r#"{"seed_url": "https://a.test/", "respect_robots_txt": false}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let job: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(job["status"], "pending");
        assert_eq!(job["domain"], "a.test");
        assert_eq!(job["max_depth"], 10);
        assert_eq!(job["max_pages"], 100_000);
        assert_eq!(job["crawl_delay_ms"], 1_000);
    }

    #[tokio::test]
    async fn create_job_rejects_out_of_range_values() {
        let state = test_state().await;
        let bodies = [
            r#"{"seed_url": "https://a.test/", "max_depth": 0}"#,
            r#"{"seed_url": "https://a.test/", "max_depth": 51}"#,
            r#"{"seed_url": "https://a.test/", "max_pages": 150001}"#,
            r#"{"seed_url": "https://a.test/", "max_concurrent_workers": 51}"#,
            r#"{"seed_url": "https://a.test/", "crawl_delay_ms": 50}"#,
            r#"{"seed_url": "https://a.test/", "exclude_patterns": ["("]}"#,
            r#"{"seed_url": "not a url"}"#,
            r#"{"seed_url": "ftp://a.test/"}"#,
        ];
        for body in bodies {
            let response = test_app(state.clone())
                .oneshot(create_request(body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body: {body}");
        }

        // Nothing was persisted by any rejected request.
        let (jobs, _) = state.manager.list_jobs(None, 10, 0).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn get_job_includes_queue_stats() {
        let state = test_state().await;
        let app = test_app(state.clone());

        let response = app
            .oneshot(create_request(
                r#"{"seed_url": "https://a.test/", "respect_robots_txt": false}"#,
            ))
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = created["id"].as_str().unwrap();

        let response = test_app(state.clone())
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/jobs/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let detail: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(detail["queue"].get("pending").is_some());
        assert!(detail.get("crawl_rate").is_some());
        assert!(detail.get("eta_seconds").is_some());
    }

    #[tokio::test]
    async fn get_job_rejects_bad_and_unknown_ids() {
        let state = test_state().await;

        let response = test_app(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/v1/jobs/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = test_app(state)
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/jobs/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_jobs_validates_paging() {
        let state = test_state().await;

        for uri in [
            "/api/v1/jobs?page=0",
            "/api/v1/jobs?limit=0",
            "/api/v1/jobs?limit=101",
            "/api/v1/jobs?status=bogus",
        ] {
            let response = test_app(state.clone())
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "uri: {uri}");
        }

        let response = test_app(state)
            .oneshot(
                Request::builder()
                    .uri("/api/v1/jobs?page=1&limit=10&status=running")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["total"], 0);
    }

    #[tokio::test]
    async fn lifecycle_routes_enforce_the_state_machine() {
        let state = test_state().await;
        let app = test_app(state.clone());

        let response = app
            .oneshot(create_request(
                r#"{"seed_url": "https://a.test/", "respect_robots_txt": false}"#,
            ))
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let id = created["id"].as_str().unwrap().to_owned();

        // Resume on a job that isn't paused is a 400.
        let response = test_app(state.clone())
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri(format!("/api/v1/jobs/{id}/resume"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Cancel succeeds once, then the terminal state rejects a second one.
        let response = test_app(state.clone())
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri(format!("/api/v1/jobs/{id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = test_app(state)
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri(format!("/api/v1/jobs/{id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
