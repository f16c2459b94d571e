use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use futures::stream::{self, StreamExt};
use serde_derive::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crawl_core::page::{Page, PageStatus};
use crawl_core::store::Store;

use super::jobs::{bad_request, map_crawl_error, parse_id, ErrorResponse};
use super::AppState;

#[derive(Deserialize, Debug)]
pub struct ListPagesQuery {
    page: Option<i64>,
    limit: Option<i64>,
    status: Option<String>,
}

#[derive(Serialize)]
pub struct PageListResponse {
    pages: Vec<Page>,
    total: i64,
    page: i64,
    limit: i64,
}

pub async fn list(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<ListPagesQuery>,
) -> Result<Json<PageListResponse>, (StatusCode, Json<ErrorResponse>)> {
    let job_id = parse_id(&job_id, "job")?;
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(100);
    if page < 1 {
        return Err(bad_request("page must be at least 1"));
    }
    if !(1..=1_000).contains(&limit) {
        return Err(bad_request("limit must be between 1 and 1000"));
    }
    let status = match &query.status {
        Some(raw) => Some(
            raw.parse::<PageStatus>()
                .map_err(|_| bad_request(&format!("{raw} is not a valid page status")))?,
        ),
        None => None,
    };

    // Listing pages of an unknown job is a 404, not an empty list.
    state
        .manager
        .get_job(job_id)
        .await
        .map_err(map_crawl_error)?;

    let (pages, total) = state
        .store
        .list_pages(job_id, status, limit, (page - 1) * limit)
        .await
        .map_err(|error| map_crawl_error(error.into()))?;
    Ok(Json(PageListResponse {
        pages,
        total,
        page,
        limit,
    }))
}

pub async fn get(
    State(state): State<AppState>,
    Path((job_id, page_id)): Path<(String, String)>,
) -> Result<Json<Page>, (StatusCode, Json<ErrorResponse>)> {
    let job_id = parse_id(&job_id, "job")?;
    let page_id = parse_id(&page_id, "page")?;

    let page = state
        .store
        .get_page(job_id, page_id)
        .await
        .map_err(|error| map_crawl_error(error.into()))?;
    Ok(Json(page))
}

#[derive(Deserialize, Debug)]
pub struct ExportQuery {
    format: Option<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum ExportFormat {
    Json,
    Csv,
}

/// Rows fetched per round-trip while streaming an export.
const EXPORT_BATCH: i64 = 200;

/// Stream a job's completed pages as JSON or CSV. Batches are read through a
/// rowid cursor, so memory use stays flat no matter how many rows the job has.
pub async fn export(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let job_id = parse_id(&job_id, "job")?;
    let format = match query.format.as_deref() {
        None | Some("json") => ExportFormat::Json,
        Some("csv") => ExportFormat::Csv,
        Some(other) => return Err(bad_request(&format!("{other} is not a valid export format"))),
    };

    state
        .manager
        .get_job(job_id)
        .await
        .map_err(map_crawl_error)?;

    let opening = match format {
        ExportFormat::Json => "[",
        ExportFormat::Csv => CSV_HEADER,
    };

    struct Cursor {
        store: Store,
        job_id: Uuid,
        after: i64,
        emitted_any: bool,
        done: bool,
        format: ExportFormat,
    }

    let cursor = Cursor {
        store: state.store.clone(),
        job_id,
        after: 0,
        emitted_any: false,
        done: false,
        format,
    };

    let rows = stream::unfold(cursor, |mut cursor| async move {
        if cursor.done {
            return None;
        }
        match cursor
            .store
            .completed_pages_after(cursor.job_id, cursor.after, EXPORT_BATCH)
            .await
        {
            Ok(batch) if batch.is_empty() => {
                cursor.done = true;
                let tail = match cursor.format {
                    ExportFormat::Json => "]",
                    ExportFormat::Csv => "",
                };
                Some((Ok::<_, std::convert::Infallible>(Bytes::from(tail)), cursor))
            }
            Ok(batch) => {
                cursor.after = batch.last().map(|(row_id, _)| *row_id).unwrap_or(cursor.after);
                let mut chunk = String::new();
                for (_, page) in &batch {
                    match cursor.format {
                        ExportFormat::Json => {
                            if cursor.emitted_any {
                                chunk.push(',');
                            }
                            match serde_json::to_string(page) {
                                Ok(rendered) => chunk.push_str(&rendered),
                                Err(error) => {
                                    error!("export serialization failed: {error}");
                                    continue;
                                }
                            }
                        }
                        ExportFormat::Csv => chunk.push_str(&csv_row(page)),
                    }
                    cursor.emitted_any = true;
                }
                Some((Ok(Bytes::from(chunk)), cursor))
            }
            Err(error) => {
                // Mid-stream failure: the body just ends; the client sees a
                // truncated document rather than a hung connection.
                error!("export query failed: {error}");
                cursor.done = true;
                None
            }
        }
    });

    let body = Body::from_stream(
        stream::once(std::future::ready(Ok::<_, std::convert::Infallible>(
            Bytes::from(opening),
        )))
        .chain(rows),
    );

    let (content_type, file_name) = match format {
        ExportFormat::Json => ("application/json", format!("{job_id}.json")),
        ExportFormat::Csv => ("text/csv", format!("{job_id}.csv")),
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(body)
        .map_err(|error| internal_export_error(&error.to_string()))
}

fn internal_export_error(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    error!("export failed: {message}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: message.to_owned(),
        }),
    )
}

const CSV_HEADER: &str = "id,url,normalized_url,depth,http_status,content_type,content_length,title,description,links_found,crawled_at,duration_ms\n";

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}

fn csv_row(page: &Page) -> String {
    let optional = |value: Option<i64>| value.map(|v| v.to_string()).unwrap_or_default();
    format!(
        "{},{},{},{},{},{},{},{},{},{},{},{}\n",
        page.id,
        csv_field(&page.url),
        csv_field(&page.normalized_url),
        page.depth,
        optional(page.http_status),
        csv_field(page.content_type.as_deref().unwrap_or_default()),
        optional(page.content_length),
        csv_field(page.title.as_deref().unwrap_or_default()),
        csv_field(page.description.as_deref().unwrap_or_default()),
        page.links_found,
        page.crawled_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default(),
        optional(page.duration_ms),
    )
}
