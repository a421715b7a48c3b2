//! Persistence collaborators (job registry, review store, source registry) + HTTP fetch
//! utilities for RVH.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::StatusCode;
use rvh_core::{JobStatus, ParseJob, RegisteredSource, StoredReview};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rvh-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait JobRegistry: Send + Sync {
    async fn create(&self, job: &ParseJob) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<ParseJob, StoreError>;

    /// Idempotent overwrite keyed by job id.
    async fn save(&self, job: &ParseJob) -> Result<(), StoreError>;

    async fn list_recent(&self, limit: usize) -> Result<Vec<ParseJob>, StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReviewSortKey {
    Rating,
    /// The review's own date.
    CreatedAt,
    #[default]
    FetchedAt,
}

impl ReviewSortKey {
    fn column(self) -> &'static str {
        match self {
            ReviewSortKey::Rating => "rating",
            ReviewSortKey::CreatedAt => "occurred_on",
            ReviewSortKey::FetchedAt => "fetched_at",
        }
    }

    fn compare(self, a: &StoredReview, b: &StoredReview) -> Ordering {
        match self {
            ReviewSortKey::Rating => a.rating.cmp(&b.rating),
            ReviewSortKey::CreatedAt => a.occurred_on.cmp(&b.occurred_on),
            ReviewSortKey::FetchedAt => a.fetched_at.cmp(&b.fetched_at),
        }
    }
}

/// Unknown names fall back to `FetchedAt`.
impl FromStr for ReviewSortKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "rating" => ReviewSortKey::Rating,
            "createdAt" | "created_at" => ReviewSortKey::CreatedAt,
            _ => ReviewSortKey::FetchedAt,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        })
    }
}

/// Only `desc` (any case) sorts descending; anything else is ascending.
impl FromStr for SortDirection {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.trim().eq_ignore_ascii_case("desc") {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewQuery {
    /// Zero-based page index.
    pub page: usize,
    pub size: usize,
    pub min_rating: Option<u8>,
    pub sort_by: ReviewSortKey,
    pub direction: SortDirection,
}

impl Default for ReviewQuery {
    fn default() -> Self {
        Self {
            page: 0,
            size: 20,
            min_rating: None,
            sort_by: ReviewSortKey::default(),
            direction: SortDirection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewPage {
    pub items: Vec<StoredReview>,
    pub page: usize,
    pub size: usize,
    pub total: usize,
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Subset of `fingerprints` already stored for exactly `source_key`.
    async fn find_existing_fingerprints(
        &self,
        source_key: &str,
        fingerprints: &[String],
    ) -> Result<HashSet<String>, StoreError>;

    /// Writes the batch atomically; a `(source_key, fingerprint)` clash fails the whole batch.
    async fn save_all(&self, reviews: Vec<StoredReview>) -> Result<usize, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Filtered by `min_rating`, ordered by `sort_by` / `direction`; ties keep insertion order.
    async fn list(&self, query: ReviewQuery) -> Result<ReviewPage, StoreError>;
}

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Registers an enabled source; a url already present is a `Conflict`.
    async fn add(&self, url: &str) -> Result<RegisteredSource, StoreError>;

    /// Every source, in id order.
    async fn list(&self) -> Result<Vec<RegisteredSource>, StoreError>;

    async fn list_enabled(&self) -> Result<Vec<RegisteredSource>, StoreError>;

    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<RegisteredSource, StoreError>;

    /// Stamps `last_triggered_at`; unknown ids are ignored.
    async fn mark_triggered(&self, ids: &[i64], at: DateTime<Utc>) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobRegistry {
    jobs: RwLock<HashMap<Uuid, ParseJob>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRegistry for InMemoryJobRegistry {
    async fn create(&self, job: &ParseJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<ParseJob, StoreError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))
    }

    async fn save(&self, job: &ParseJob) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ParseJob>, StoreError> {
        let mut jobs = self.jobs.read().await.values().cloned().collect::<Vec<_>>();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryReviewStore {
    reviews: RwLock<Vec<StoredReview>>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReviewStore for InMemoryReviewStore {
    async fn find_existing_fingerprints(
        &self,
        source_key: &str,
        fingerprints: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let wanted = fingerprints.iter().collect::<HashSet<_>>();
        Ok(self
            .reviews
            .read()
            .await
            .iter()
            .filter(|r| r.source_key == source_key && wanted.contains(&r.fingerprint))
            .map(|r| r.fingerprint.clone())
            .collect())
    }

    async fn save_all(&self, reviews: Vec<StoredReview>) -> Result<usize, StoreError> {
        let mut stored = self.reviews.write().await;
        let mut keys = stored
            .iter()
            .map(|r| (r.source_key.clone(), r.fingerprint.clone()))
            .collect::<HashSet<_>>();
        for review in &reviews {
            if !keys.insert((review.source_key.clone(), review.fingerprint.clone())) {
                return Err(StoreError::Conflict(format!(
                    "review {} already stored for {}",
                    review.fingerprint, review.source_key
                )));
            }
        }
        let written = reviews.len();
        stored.extend(reviews);
        Ok(written)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.reviews.read().await.len())
    }

    async fn list(&self, query: ReviewQuery) -> Result<ReviewPage, StoreError> {
        let size = query.size.max(1);
        let mut filtered = self
            .reviews
            .read()
            .await
            .iter()
            .filter(|r| query.min_rating.map_or(true, |min| r.rating >= min))
            .cloned()
            .collect::<Vec<_>>();
        filtered.sort_by(|a, b| {
            let order = query.sort_by.compare(a, b);
            match query.direction {
                SortDirection::Asc => order,
                SortDirection::Desc => order.reverse(),
            }
        });
        let total = filtered.len();
        let items = filtered
            .into_iter()
            .skip(query.page.saturating_mul(size))
            .take(size)
            .collect();
        Ok(ReviewPage {
            items,
            page: query.page,
            size,
            total,
        })
    }
}

#[derive(Debug, Default)]
pub struct InMemorySourceStore {
    sources: RwLock<BTreeMap<i64, RegisteredSource>>,
}

impl InMemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceStore for InMemorySourceStore {
    async fn add(&self, url: &str) -> Result<RegisteredSource, StoreError> {
        let url = url.trim();
        let mut sources = self.sources.write().await;
        if sources.values().any(|s| s.url == url) {
            return Err(StoreError::Conflict(format!("source {url} already registered")));
        }
        let id = sources.keys().next_back().map_or(1, |last| last + 1);
        let source = RegisteredSource {
            id,
            url: url.to_string(),
            enabled: true,
            last_triggered_at: None,
        };
        sources.insert(id, source.clone());
        Ok(source)
    }

    async fn list(&self) -> Result<Vec<RegisteredSource>, StoreError> {
        Ok(self.sources.read().await.values().cloned().collect())
    }

    async fn list_enabled(&self) -> Result<Vec<RegisteredSource>, StoreError> {
        Ok(self
            .sources
            .read()
            .await
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect())
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<RegisteredSource, StoreError> {
        let mut sources = self.sources.write().await;
        let source = sources
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("source {id}")))?;
        source.enabled = enabled;
        Ok(source.clone())
    }

    async fn mark_triggered(&self, ids: &[i64], at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut sources = self.sources.write().await;
        for id in ids {
            if let Some(source) = sources.get_mut(id) {
                source.last_triggered_at = Some(at);
            }
        }
        Ok(())
    }
}

pub async fn connect_pool(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .with_context(|| "connecting to postgres".to_string())
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running migrations")
}

#[derive(Debug, Clone)]
pub struct PgJobRegistry {
    pool: PgPool,
}

impl PgJobRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &PgRow) -> Result<ParseJob, StoreError> {
    let status: String = row.try_get("status")?;
    let created_reviews: Option<i32> = row.try_get("created_reviews")?;
    Ok(ParseJob {
        id: row.try_get("id")?,
        source_key: row.try_get("source_key")?,
        status: status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_reviews: created_reviews
            .map(|n| u32::try_from(n).map_err(|_| StoreError::Corrupt(format!("created_reviews={n}"))))
            .transpose()?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl JobRegistry for PgJobRegistry {
    async fn create(&self, job: &ParseJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO parse_jobs (id, source_key, status, created_at, started_at, finished_at, created_reviews, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id)
        .bind(&job.source_key)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.created_reviews.map(|n| n as i32))
        .bind(&job.error_message)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("job {} already exists", job.id))
            }
            other => StoreError::Database(other),
        })?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<ParseJob, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, source_key, status, created_at, started_at, finished_at, created_reviews, error_message
              FROM parse_jobs
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        job_from_row(&row)
    }

    async fn save(&self, job: &ParseJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO parse_jobs (id, source_key, status, created_at, started_at, finished_at, created_reviews, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
               SET status = EXCLUDED.status,
                   started_at = EXCLUDED.started_at,
                   finished_at = EXCLUDED.finished_at,
                   created_reviews = EXCLUDED.created_reviews,
                   error_message = EXCLUDED.error_message
            "#,
        )
        .bind(job.id)
        .bind(&job.source_key)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.created_reviews.map(|n| n as i32))
        .bind(&job.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<ParseJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_key, status, created_at, started_at, finished_at, created_reviews, error_message
              FROM parse_jobs
             ORDER BY created_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgReviewStore {
    pool: PgPool,
}

impl PgReviewStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn review_from_row(row: &PgRow) -> Result<StoredReview, StoreError> {
    let rating: i16 = row.try_get("rating")?;
    let occurred_on: NaiveDate = row.try_get("occurred_on")?;
    let fetched_at: DateTime<Utc> = row.try_get("fetched_at")?;
    Ok(StoredReview {
        source_key: row.try_get("source_key")?,
        author: row.try_get("author")?,
        rating: u8::try_from(rating).map_err(|_| StoreError::Corrupt(format!("rating={rating}")))?,
        text: row.try_get("text")?,
        occurred_on,
        fetched_at,
        fingerprint: row.try_get("fingerprint")?,
    })
}

#[async_trait]
impl ReviewStore for PgReviewStore {
    async fn find_existing_fingerprints(
        &self,
        source_key: &str,
        fingerprints: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        if fingerprints.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT fingerprint
              FROM reviews
             WHERE source_key = $1
               AND fingerprint = ANY($2)
            "#,
        )
        .bind(source_key)
        .bind(fingerprints.to_vec())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("fingerprint").map_err(StoreError::from))
            .collect()
    }

    async fn save_all(&self, reviews: Vec<StoredReview>) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for review in &reviews {
            sqlx::query(
                r#"
                INSERT INTO reviews (source_key, author, rating, text, occurred_on, fetched_at, fingerprint)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&review.source_key)
            .bind(&review.author)
            .bind(i16::from(review.rating))
            .bind(&review.text)
            .bind(review.occurred_on)
            .bind(review.fetched_at)
            .bind(&review.fingerprint)
            .execute(&mut *tx)
            .await
            .map_err(|err| match err {
                sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(format!(
                    "review {} already stored for {}",
                    review.fingerprint, review.source_key
                )),
                other => StoreError::Database(other),
            })?;
        }
        tx.commit().await?;
        Ok(reviews.len())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reviews")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.max(0) as usize)
    }

    async fn list(&self, query: ReviewQuery) -> Result<ReviewPage, StoreError> {
        let size = query.size.max(1);
        let min_rating = query.min_rating.map(i16::from).unwrap_or(0);
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reviews WHERE rating >= $1")
            .bind(min_rating)
            .fetch_one(&self.pool)
            .await?;
        // column and direction come from closed enums, never from request text
        let sql = format!(
            r#"
            SELECT source_key, author, rating, text, occurred_on, fetched_at, fingerprint
              FROM reviews
             WHERE rating >= $1
             ORDER BY {column} {direction}, id ASC
             LIMIT $2 OFFSET $3
            "#,
            column = query.sort_by.column(),
            direction = query.direction.sql(),
        );
        let rows = sqlx::query(&sql)
        .bind(min_rating)
        .bind(size as i64)
        .bind(query.page.saturating_mul(size) as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ReviewPage {
            items: rows.iter().map(review_from_row).collect::<Result<_, _>>()?,
            page: query.page,
            size,
            total: total.max(0) as usize,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn source_from_row(row: &PgRow) -> Result<RegisteredSource, StoreError> {
    Ok(RegisteredSource {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        enabled: row.try_get("enabled")?,
        last_triggered_at: row.try_get("last_triggered_at")?,
    })
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn add(&self, url: &str) -> Result<RegisteredSource, StoreError> {
        let url = url.trim();
        let row = sqlx::query(
            r#"
            INSERT INTO sources (url, enabled)
            VALUES ($1, TRUE)
            RETURNING id, url, enabled, last_triggered_at
            "#,
        )
        .bind(url)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(format!("source {url} already registered"))
            }
            other => StoreError::Database(other),
        })?;
        source_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<RegisteredSource>, StoreError> {
        let rows = sqlx::query("SELECT id, url, enabled, last_triggered_at FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn list_enabled(&self) -> Result<Vec<RegisteredSource>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, url, enabled, last_triggered_at FROM sources WHERE enabled ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<RegisteredSource, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE sources
               SET enabled = $2
             WHERE id = $1
            RETURNING id, url, enabled, last_triggered_at
            "#,
        )
        .bind(id)
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("source {id}")))?;
        source_from_row(&row)
    }

    async fn mark_triggered(&self, ids: &[i64], at: DateTime<Utc>) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE sources SET last_triggered_at = $2 WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

/// Shared blocking-style fetch transport: one attempt per call, bounded concurrency.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_fetch", url))
        .await
    }
}
