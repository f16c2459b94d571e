pub mod jobs;
pub mod pages;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing, Json, Router};
use serde_derive::Serialize;

use crawl_core::manager::JobManager;
use crawl_core::store::Store;

use crate::config::JobDefaults;

#[derive(Clone)]
pub struct AppState {
    pub manager: JobManager,
    pub store: Store,
    pub defaults: JobDefaults,
}

pub fn add_routes(router: Router, state: AppState) -> Router {
    router.merge(
        Router::new()
            .route("/", routing::get(index))
            .route("/_readiness", routing::get(index))
            .route("/_liveness", routing::get(index))
            .route("/_health", routing::get(health))
            .route(
                "/api/v1/jobs",
                routing::post(jobs::create).get(jobs::list),
            )
            .route("/api/v1/jobs/:job_id", routing::get(jobs::get))
            .route("/api/v1/jobs/:job_id/pause", routing::post(jobs::pause))
            .route("/api/v1/jobs/:job_id/resume", routing::post(jobs::resume))
            .route("/api/v1/jobs/:job_id/cancel", routing::post(jobs::cancel))
            .route("/api/v1/jobs/:job_id/pages", routing::get(pages::list))
            .route(
                "/api/v1/jobs/:job_id/pages/:page_id",
                routing::get(pages::get),
            )
            .route("/api/v1/jobs/:job_id/export", routing::get(pages::export))
            .with_state(state),
    )
}

pub async fn index() -> &'static str {
    "crawl-server"
}

#[derive(Serialize)]
struct HealthResponse {
    database: &'static str,
    #[serde(rename = "queue-store")]
    queue_store: &'static str,
}

/// Component health: the database connection and the frontier relation.
/// Degrades to 503 when either probe fails.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = state.store.ping().await.is_ok();
    let queue_store = state.store.ping_frontier().await.is_ok();

    let up = |ok: bool| if ok { "up" } else { "down" };
    let status = if database && queue_store {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            database: up(database),
            queue_store: up(queue_store),
        }),
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt; // for `collect`
    use tower::ServiceExt; // for `oneshot`

    #[tokio::test]
    async fn index_answers() {
        let app = test_util::test_app(test_util::test_state().await);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"crawl-server");
    }

    #[tokio::test]
    async fn health_reports_both_components_up() {
        let app = test_util::test_app(test_util::test_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/_health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["database"], "up");
        assert_eq!(parsed["queue-store"], "up");
    }
}
