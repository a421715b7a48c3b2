//! Axum JSON surface for RVH: job submission and polling, source management, stored reviews
//! and the stub source.

use std::fmt::Display;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Days, NaiveDate, Utc};
use rand::Rng;
use rvh_adapters::{SourceTarget, StubRecord};
use rvh_core::{JobStatus, ParseJob, RegisteredSource, StoredReview};
use rvh_storage::{ReviewQuery, ReviewStore, SourceStore, StoreError};
use rvh_sync::{JobOrchestrator, OrchestratorError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rvh-web";

const DEFAULT_JOB_LIMIT: usize = 20;
const MAX_JOB_LIMIT: usize = 200;
const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 200;
const MAX_STUB_COUNT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: JobOrchestrator,
    pub reviews: Arc<dyn ReviewStore>,
    pub sources: Arc<dyn SourceStore>,
}

impl AppState {
    pub fn new(
        orchestrator: JobOrchestrator,
        reviews: Arc<dyn ReviewStore>,
        sources: Arc<dyn SourceStore>,
    ) -> Self {
        Self {
            orchestrator,
            reviews,
            sources,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParseRequest {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddSourceRequest {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceResponse {
    pub id: i64,
    pub url: String,
    pub enabled: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl From<RegisteredSource> for SourceResponse {
    fn from(source: RegisteredSource) -> Self {
        Self {
            id: source.id,
            url: source.url,
            enabled: source.enabled,
            last_triggered_at: source.last_triggered_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: Uuid,
    pub source_url: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_reviews: Option<u32>,
    pub error_message: Option<String>,
}

impl From<ParseJob> for JobResponse {
    fn from(job: ParseJob) -> Self {
        Self {
            id: job.id,
            source_url: job.source_key,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            created_reviews: job.created_reviews,
            error_message: job.error_message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewResponse {
    pub source_url: String,
    pub author_name: String,
    pub rating: u8,
    pub text: String,
    pub created_at: NaiveDate,
    pub fetched_at: DateTime<Utc>,
}

impl From<StoredReview> for ReviewResponse {
    fn from(review: StoredReview) -> Self {
        Self {
            source_url: review.source_key,
            author_name: review.author,
            rating: review.rating,
            text: review.text,
            created_at: review.occurred_on,
            fetched_at: review.fetched_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPageResponse {
    pub content: Vec<ReviewResponse>,
    pub page: usize,
    pub size: usize,
    pub total_elements: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct JobsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ReviewsQuery {
    page: Option<usize>,
    size: Option<usize>,
    #[serde(alias = "minRating")]
    min_rating: Option<u8>,
    #[serde(alias = "sortBy")]
    sort_by: Option<String>,
    direction: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StubQuery {
    url: String,
    #[serde(default = "default_stub_count")]
    count: usize,
}

fn default_stub_count() -> usize {
    5
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/parse", post(parse_handler))
        .route("/jobs", get(jobs_handler))
        .route("/jobs/{id}", get(job_handler))
        .route("/reviews", get(reviews_handler))
        .route("/answer/parallel", get(reviews_handler))
        .route("/sources", get(list_sources_handler).post(add_source_handler))
        .route("/sources/{id}/enable", post(enable_source_handler))
        .route("/sources/{id}/disable", post(disable_source_handler))
        .route("/stub/reviews", get(stub_reviews_handler))
        .with_state(Arc::new(state))
}

pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))
}

pub async fn serve_on(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("reading bound address")?;
    info!(%addr, "http server listening");
    axum::serve(listener, app(state))
        .await
        .context("serving http")?;
    Ok(())
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    serve_on(bind(port).await?, state).await
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn parse_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ParseRequest>,
) -> Response {
    match state.orchestrator.start(&request.url).await {
        Ok(job_id) => Json(JobIdResponse { job_id }).into_response(),
        Err(OrchestratorError::Validation(message)) => {
            error_response(StatusCode::BAD_REQUEST, message)
        }
        Err(err) => server_error(err),
    }
}

async fn job_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Response {
    match state.orchestrator.job(id).await {
        Ok(job) => Json(JobResponse::from(job)).into_response(),
        Err(err) => store_error(err),
    }
}

async fn jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIMIT).clamp(1, MAX_JOB_LIMIT);
    match state.orchestrator.jobs().list_recent(limit).await {
        Ok(jobs) => Json(
            jobs.into_iter()
                .map(JobResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn reviews_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReviewsQuery>,
) -> Response {
    let review_query = ReviewQuery {
        page: query.page.unwrap_or(0),
        size: query.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        min_rating: query.min_rating,
        sort_by: query
            .sort_by
            .as_deref()
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default(),
        direction: query
            .direction
            .as_deref()
            .map(|s| s.parse().unwrap_or_default())
            .unwrap_or_default(),
    };
    match state.reviews.list(review_query).await {
        Ok(page) => Json(ReviewPageResponse {
            total_pages: page.total.div_ceil(page.size),
            content: page.items.into_iter().map(ReviewResponse::from).collect(),
            page: page.page,
            size: page.size,
            total_elements: page.total,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn list_sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.sources.list().await {
        Ok(sources) => Json(
            sources
                .into_iter()
                .map(SourceResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn add_source_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddSourceRequest>,
) -> Response {
    if let Err(err) = SourceTarget::classify(&request.url) {
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }
    match state.sources.add(&request.url).await {
        Ok(source) => Json(SourceResponse::from(source)).into_response(),
        Err(err) => store_error(err),
    }
}

async fn enable_source_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    set_source_enabled(&state, id, true).await
}

async fn disable_source_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> Response {
    set_source_enabled(&state, id, false).await
}

async fn set_source_enabled(state: &AppState, id: i64, enabled: bool) -> Response {
    match state.sources.set_enabled(id, enabled).await {
        Ok(source) => Json(SourceResponse::from(source)).into_response(),
        Err(err) => store_error(err),
    }
}

/// Fresh random records on every call. A `page` parameter is accepted and ignored.
async fn stub_reviews_handler(Query(query): Query<StubQuery>) -> Json<Vec<StubRecord>> {
    Json(random_stub_records(&query.url, query.count.min(MAX_STUB_COUNT)))
}

fn random_stub_records(url: &str, count: usize) -> Vec<StubRecord> {
    let mut rng = rand::thread_rng();
    let today = Utc::now().date_naive();
    (0..count)
        .map(|_| StubRecord {
            author_name: format!("user{}", rng.gen_range(1000..10000)),
            rating: rng.gen_range(1..=5),
            text: format!("review of {url} #{}", rng.gen_range(0..10000)),
            created_at: today
                .checked_sub_days(Days::new(rng.gen_range(0..365)))
                .unwrap_or(today),
        })
        .collect()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(what) => {
            error_response(StatusCode::NOT_FOUND, format!("{what} not found"))
        }
        StoreError::Conflict(what) => error_response(StatusCode::CONFLICT, what),
        other => server_error(other),
    }
}

fn server_error(err: impl Display) -> Response {
    error!(error = %err, "request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("server error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use rvh_adapters::{
        decode_stub_page, AdapterError, CursorPage, CursorSource, PagedSource, SourceAdapters,
    };
    use rvh_core::RawRecord;
    use rvh_adapters::StubPageAdapter;
    use rvh_storage::{
        HttpClientConfig, HttpFetcher, InMemoryJobRegistry, InMemoryReviewStore, InMemorySourceStore,
    };
    use rvh_sync::{OrchestratorSettings, RvhConfig, TracingEventSink};
    use tower::ServiceExt;

    struct FixedSource;

    #[async_trait]
    impl PagedSource for FixedSource {
        async fn fetch_page(
            &self,
            source_key: &str,
            page_size: usize,
            page_index: usize,
        ) -> Result<Vec<RawRecord>, AdapterError> {
            Ok((0..page_size)
                .map(|n| {
                    RawRecord::new(
                        format!("user{page_index}{n}"),
                        if n % 2 == 0 { 5 } else { 2 },
                        format!("{source_key} {page_index}/{n}"),
                        NaiveDate::from_ymd_opt(2025, 12, 20).unwrap(),
                    )
                })
                .collect())
        }
    }

    #[async_trait]
    impl CursorSource for FixedSource {
        async fn fetch_page(
            &self,
            _app_id: &str,
            _cursor: &str,
            _page_size: usize,
        ) -> Result<CursorPage, AdapterError> {
            Ok(CursorPage {
                records: Vec::new(),
                next_cursor: None,
            })
        }
    }

    fn state() -> AppState {
        let reviews = Arc::new(InMemoryReviewStore::new());
        let source = Arc::new(FixedSource);
        let orchestrator = JobOrchestrator::new(
            OrchestratorSettings::from(&RvhConfig::default()),
            Arc::new(InMemoryJobRegistry::new()),
            reviews.clone(),
            SourceAdapters::new(source.clone(), source),
            Arc::new(TracingEventSink),
        );
        AppState::new(orchestrator, reviews, Arc::new(InMemorySourceStore::new()))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let resp = app(state()).oneshot(get_req("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn parse_then_poll_job_then_list_reviews() {
        let state = state();
        let orchestrator = state.orchestrator.clone();
        let app = app(state);

        let resp = app
            .clone()
            .oneshot(post_json("/parse", r#"{"url":"https://example.com/product/123"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let job_id: Uuid = body_json(resp).await["jobId"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();

        orchestrator
            .wait_for_terminal(job_id, Duration::from_secs(10))
            .await
            .unwrap();

        let job = body_json(
            app.clone()
                .oneshot(get_req(&format!("/jobs/{job_id}")))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(job["status"], "SUCCESS");
        assert_eq!(job["createdReviews"], 15);
        assert_eq!(job["sourceUrl"], "https://example.com/product/123");

        let recent = body_json(app.clone().oneshot(get_req("/jobs?limit=5")).await.unwrap()).await;
        assert_eq!(recent.as_array().unwrap().len(), 1);

        let page = body_json(
            app.oneshot(get_req("/reviews?page=0&size=4&minRating=5"))
                .await
                .unwrap(),
        )
        .await;
        // n = 0, 2, 4 rate 5 on each of three pages
        assert_eq!(page["totalElements"], 9);
        assert_eq!(page["totalPages"], 3);
        assert_eq!(page["content"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn blank_url_is_a_bad_request() {
        let resp = app(state())
            .oneshot(post_json("/parse", r#"{"url":"   "}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("blank"));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let resp = app(state())
            .oneshot(get_req(&format!("/jobs/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stub_endpoint_serves_what_the_paged_adapter_decodes() {
        let resp = app(state())
            .oneshot(get_req("/stub/reviews?url=https%3A%2F%2Fx%2Fa&count=7&page=2"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();

        let records = decode_stub_page(&body).unwrap();
        assert_eq!(records.len(), 7);
        assert!(records.iter().all(|r| (1..=5).contains(&r.rating)));
        assert!(records.iter().all(|r| r.text.contains("https://x/a")));
    }

    #[tokio::test]
    async fn sources_can_be_added_listed_and_toggled() {
        let app = app(state());

        let resp = app
            .clone()
            .oneshot(post_json("/sources", r#"{"url":" https://x/a "}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let added = body_json(resp).await;
        assert_eq!(added["url"], "https://x/a");
        assert_eq!(added["enabled"], true);
        assert!(added["lastTriggeredAt"].is_null());
        let id = added["id"].as_i64().unwrap();

        let resp = app
            .clone()
            .oneshot(post_json(&format!("/sources/{id}/disable"), ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["enabled"], false);

        let resp = app.clone().oneshot(get_req("/sources")).await.unwrap();
        let listed = body_json(resp).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["enabled"], false);

        let resp = app
            .clone()
            .oneshot(post_json(&format!("/sources/{id}/enable"), ""))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["enabled"], true);
    }

    #[tokio::test]
    async fn duplicate_blank_and_unknown_sources_are_rejected() {
        let app = app(state());
        let resp = app
            .clone()
            .oneshot(post_json("/sources", r#"{"url":"steam:570"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(post_json("/sources", r#"{"url":"steam:570"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        for body in [r#"{"url":"  "}"#, r#"{"url":"steam:abc"}"#, "{}"] {
            let resp = app.clone().oneshot(post_json("/sources", body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{body}");
        }

        let resp = app
            .clone()
            .oneshot(post_json("/sources/999/enable", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reviews_honor_sort_key_and_direction() {
        let state = state();
        let reviews = state.reviews.clone();
        let batch = [(3, 1), (5, 2), (1, 3)]
            .into_iter()
            .map(|(rating, day)| StoredReview {
                source_key: "https://x/a".into(),
                author: format!("user{day}"),
                rating,
                text: format!("day {day}"),
                occurred_on: NaiveDate::from_ymd_opt(2025, 12, day).unwrap(),
                fetched_at: Utc::now(),
                fingerprint: format!("fp{day}"),
            })
            .collect::<Vec<_>>();
        reviews.save_all(batch).await.unwrap();
        let app = app(state);

        let ratings = |page: serde_json::Value| {
            page["content"]
                .as_array()
                .unwrap()
                .iter()
                .map(|r| r["rating"].as_u64().unwrap())
                .collect::<Vec<_>>()
        };

        let resp = app
            .clone()
            .oneshot(get_req("/reviews?sortBy=rating&direction=asc"))
            .await
            .unwrap();
        assert_eq!(ratings(body_json(resp).await), vec![1, 3, 5]);

        let resp = app
            .clone()
            .oneshot(get_req("/answer/parallel?sortBy=createdAt&direction=DESC&minRating=2"))
            .await
            .unwrap();
        assert_eq!(ratings(body_json(resp).await), vec![5, 3]);
    }

    #[tokio::test]
    async fn stub_router_serves_the_paged_adapter_over_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_on(listener, state()));

        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapter = StubPageAdapter::new(http, format!("http://{addr}"));
        let records = PagedSource::fetch_page(&adapter, "https://x/a", 4, 1)
            .await
            .unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.text.contains("https://x/a")));
    }
}
