use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::page::{Page, PagePatch, PageStatus};

use super::frontier::DiscoveredUrl;
use super::Store;

#[derive(sqlx::FromRow)]
struct PageRow {
    row_id: i64,
    id: String,
    job_id: String,
    url: String,
    normalized_url: String,
    depth: i64,
    status: String,
    http_status: Option<i64>,
    content_type: Option<String>,
    content_length: Option<i64>,
    title: Option<String>,
    description: Option<String>,
    content: Option<String>,
    links_found: i64,
    crawled_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    error_message: Option<String>,
    retry_count: i64,
}

impl TryFrom<PageRow> for Page {
    type Error = StoreError;

    fn try_from(row: PageRow) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&row.id).map_err(|_| StoreError::ParseUuidError(row.id))?;
        let job_id =
            Uuid::parse_str(&row.job_id).map_err(|_| StoreError::ParseUuidError(row.job_id))?;
        let status: PageStatus = row.status.parse()?;

        Ok(Page {
            id,
            job_id,
            url: row.url,
            normalized_url: row.normalized_url,
            depth: row.depth,
            status,
            http_status: row.http_status,
            content_type: row.content_type,
            content_length: row.content_length,
            title: row.title,
            description: row.description,
            content: row.content,
            links_found: row.links_found,
            crawled_at: row.crawled_at,
            duration_ms: row.duration_ms,
            error_message: row.error_message,
            retry_count: row.retry_count,
        })
    }
}

const PAGE_COLUMNS: &str = "rowid AS row_id, id, job_id, url, normalized_url, depth, status, \
     http_status, content_type, content_length, title, description, content, links_found, \
     crawled_at, duration_ms, error_message, retry_count";

impl Store {
    /// Insert a page if no row exists for `(job_id, normalized_url)`.
    /// Returns whether a row was inserted; false means the URL was already
    /// known to this job.
    pub async fn upsert_page(
        &self,
        job_id: Uuid,
        url: &str,
        normalized_url: &str,
        depth: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
INSERT INTO page (id, job_id, url, normalized_url, depth, status)
VALUES (?, ?, ?, ?, ?, 'pending')
ON CONFLICT (job_id, normalized_url) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(job_id.to_string())
        .bind(url)
        .bind(normalized_url)
        .bind(depth)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Batch insert-if-absent for a page of discoveries. Returns the number
    /// of rows actually inserted, which is the `discovered` delta; URLs
    /// already known to the job contribute nothing.
    pub async fn batch_upsert_pages(
        &self,
        job_id: Uuid,
        discoveries: &[DiscoveredUrl],
    ) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for chunk in discoveries.chunks(100) {
            let mut builder = sqlx::QueryBuilder::new(
                "INSERT INTO page (id, job_id, url, normalized_url, depth, status) ",
            );
            builder.push_values(chunk, |mut row, discovery| {
                row.push_bind(Uuid::new_v4().to_string())
                    .push_bind(job_id.to_string())
                    .push_bind(&discovery.url)
                    .push_bind(&discovery.normalized_url)
                    .push_bind(discovery.depth)
                    .push_bind("pending");
            });
            builder.push(" ON CONFLICT (job_id, normalized_url) DO NOTHING");

            let result = builder.build().execute(&self.pool).await.map_err(|error| {
                StoreError::QueryError {
                    command: "INSERT".to_owned(),
                    error,
                }
            })?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    /// Transition a page identified by its dedup key, applying patch fields.
    pub async fn update_page(
        &self,
        job_id: Uuid,
        normalized_url: &str,
        status: PageStatus,
        patch: PagePatch,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
UPDATE page
SET
    status = ?,
    http_status = COALESCE(?, http_status),
    content_type = COALESCE(?, content_type),
    content_length = COALESCE(?, content_length),
    title = COALESCE(?, title),
    description = COALESCE(?, description),
    content = COALESCE(?, content),
    links_found = COALESCE(?, links_found),
    crawled_at = COALESCE(?, crawled_at),
    duration_ms = COALESCE(?, duration_ms),
    error_message = COALESCE(?, error_message),
    retry_count = COALESCE(?, retry_count)
WHERE job_id = ? AND normalized_url = ?
            "#,
        )
        .bind(status.as_str())
        .bind(patch.http_status)
        .bind(patch.content_type)
        .bind(patch.content_length)
        .bind(patch.title)
        .bind(patch.description)
        .bind(patch.content)
        .bind(patch.links_found)
        .bind(patch.crawled_at)
        .bind(patch.duration_ms)
        .bind(patch.error_message)
        .bind(patch.retry_count)
        .bind(job_id.to_string())
        .bind(normalized_url)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;
        Ok(())
    }

    /// Direct index lookup of one page, validated against its owning job.
    pub async fn get_page(&self, job_id: Uuid, page_id: Uuid) -> Result<Page, StoreError> {
        let query = format!("SELECT {PAGE_COLUMNS} FROM page WHERE job_id = ? AND id = ?");
        let row: Option<PageRow> = sqlx::query_as(&query)
            .bind(job_id.to_string())
            .bind(page_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        row.ok_or(StoreError::PageNotFound(page_id))?.try_into()
    }

    /// Pages in discovery order, optionally filtered by status, plus the
    /// total count matching the filter.
    pub async fn list_pages(
        &self,
        job_id: Uuid,
        status: Option<PageStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Page>, i64), StoreError> {
        let (filter, count_query) = match status {
            Some(_) => (
                " AND status = ?",
                "SELECT COUNT(*) FROM page WHERE job_id = ? AND status = ?",
            ),
            None => ("", "SELECT COUNT(*) FROM page WHERE job_id = ?"),
        };
        let query = format!(
            "SELECT {PAGE_COLUMNS} FROM page WHERE job_id = ?{filter} ORDER BY rowid LIMIT ? OFFSET ?"
        );

        let mut select = sqlx::query_as::<_, PageRow>(&query).bind(job_id.to_string());
        let mut count = sqlx::query_scalar::<_, i64>(count_query).bind(job_id.to_string());
        if let Some(status) = status {
            select = select.bind(status.as_str());
            count = count.bind(status.as_str());
        }

        let rows = select
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;
        let total = count
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        let pages = rows
            .into_iter()
            .map(Page::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((pages, total))
    }

    /// One batch of completed pages after a rowid cursor, for streaming
    /// exports that must not buffer the whole result set.
    pub async fn completed_pages_after(
        &self,
        job_id: Uuid,
        after_row_id: i64,
        limit: i64,
    ) -> Result<Vec<(i64, Page)>, StoreError> {
        let query = format!(
            "SELECT {PAGE_COLUMNS} FROM page \
             WHERE job_id = ? AND status = 'completed' AND rowid > ? \
             ORDER BY rowid LIMIT ?"
        );
        let rows: Vec<PageRow> = sqlx::query_as(&query)
            .bind(job_id.to_string())
            .bind(after_row_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        rows.into_iter()
            .map(|row| {
                let row_id = row.row_id;
                Page::try_from(row).map(|page| (row_id, page))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobConfig;
    use crate::store::test_store;

    async fn job_id(store: &Store) -> Uuid {
        store
            .create_job(&JobConfig::new("https://a.test/"), "a.test")
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn upsert_is_insert_if_absent() {
        let store = test_store().await;
        let job = job_id(&store).await;

        assert!(store
            .upsert_page(job, "https://a.test/a/", "https://a.test/a", 1)
            .await
            .unwrap());
        // Same normalized URL, different original: no new row.
        assert!(!store
            .upsert_page(job, "https://a.test/a?utm_source=x", "https://a.test/a", 1)
            .await
            .unwrap());

        // A different job gets its own row.
        let other_job = job_id(&store).await;
        assert!(store
            .upsert_page(other_job, "https://a.test/a", "https://a.test/a", 1)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn batch_upsert_counts_only_new_rows() {
        let store = test_store().await;
        let job = job_id(&store).await;

        let first = vec![
            DiscoveredUrl {
                url: "https://a.test/x".to_owned(),
                normalized_url: "https://a.test/x".to_owned(),
                depth: 1,
                priority: 9,
            },
            DiscoveredUrl {
                url: "https://a.test/y".to_owned(),
                normalized_url: "https://a.test/y".to_owned(),
                depth: 1,
                priority: 9,
            },
        ];
        assert_eq!(store.batch_upsert_pages(job, &first).await.unwrap(), 2);

        let overlapping = vec![
            first[0].clone(),
            DiscoveredUrl {
                url: "https://a.test/z".to_owned(),
                normalized_url: "https://a.test/z".to_owned(),
                depth: 2,
                priority: 8,
            },
        ];
        assert_eq!(store.batch_upsert_pages(job, &overlapping).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_patches_and_direct_lookup() {
        let store = test_store().await;
        let job = job_id(&store).await;
        store
            .upsert_page(job, "https://a.test/x", "https://a.test/x", 0)
            .await
            .unwrap();

        store
            .update_page(
                job,
                "https://a.test/x",
                PageStatus::Completed,
                PagePatch {
                    http_status: Some(200),
                    title: Some("X".to_owned()),
                    content: Some("hello".to_owned()),
                    links_found: Some(3),
                    crawled_at: Some(Utc::now()),
                    duration_ms: Some(42),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (pages, total) = store.list_pages(job, None, 10, 0).await.unwrap();
        assert_eq!(total, 1);
        let page = &pages[0];
        assert_eq!(page.status, PageStatus::Completed);
        assert_eq!(page.http_status, Some(200));
        assert_eq!(page.title.as_deref(), Some("X"));
        assert_eq!(page.links_found, 3);

        let direct = store.get_page(job, page.id).await.unwrap();
        assert_eq!(direct.normalized_url, "https://a.test/x");

        // Wrong job id must not leak another job's page.
        let other_job = job_id(&store).await;
        assert!(matches!(
            store.get_page(other_job, page.id).await,
            Err(StoreError::PageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn export_cursor_pages_through_completed_only() {
        let store = test_store().await;
        let job = job_id(&store).await;

        for index in 0..5 {
            let url = format!("https://a.test/p{index}");
            store.upsert_page(job, &url, &url, 1).await.unwrap();
            if index != 2 {
                store
                    .update_page(job, &url, PageStatus::Completed, PagePatch::default())
                    .await
                    .unwrap();
            }
        }

        let mut cursor = 0;
        let mut seen = Vec::new();
        loop {
            let batch = store.completed_pages_after(job, cursor, 2).await.unwrap();
            if batch.is_empty() {
                break;
            }
            cursor = batch.last().map(|(row_id, _)| *row_id).unwrap_or(cursor);
            seen.extend(batch.into_iter().map(|(_, page)| page.normalized_url));
        }

        assert_eq!(
            seen,
            vec![
                "https://a.test/p0",
                "https://a.test/p1",
                "https://a.test/p3",
                "https://a.test/p4",
            ]
        );
    }
}
