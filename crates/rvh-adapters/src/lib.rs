//! Source adapter contracts + the stub (fixed pages) and Steam (cursor) implementations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use rvh_core::{RawRecord, MAX_RATING, MIN_RATING, UNKNOWN_AUTHOR};
use rvh_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "rvh-adapters";

/// Cursor value meaning "first page".
pub const FIRST_PAGE_CURSOR: &str = "*";

pub const STEAM_PREFIX: &str = "steam:";
pub const DEFAULT_STEAM_BASE_URL: &str = "https://store.steampowered.com";
pub const MAX_STEAM_PAGE_SIZE: usize = 100;

const STEAM_STORE_APP_MARKER: &str = "store.steampowered.com/app/";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid source: {0}")]
    Validation(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Which collection strategy a source key needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceTarget {
    Paged { source_key: String },
    Cursor { app_id: String },
}

impl SourceTarget {
    pub fn classify(input: &str) -> Result<Self, AdapterError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AdapterError::Validation("source url must not be blank".into()));
        }
        if is_steam_source(trimmed) {
            return Ok(SourceTarget::Cursor {
                app_id: extract_steam_app_id(trimmed)?,
            });
        }
        Ok(SourceTarget::Paged {
            source_key: trimmed.to_string(),
        })
    }

    /// Single-flight identity: all spellings of one Steam app share a key.
    pub fn guard_key(&self) -> String {
        match self {
            SourceTarget::Paged { source_key } => source_key.clone(),
            SourceTarget::Cursor { app_id } => format!("{STEAM_PREFIX}{app_id}"),
        }
    }
}

pub fn is_steam_source(input: &str) -> bool {
    let s = input.trim();
    s.starts_with(STEAM_PREFIX) || s.contains(STEAM_STORE_APP_MARKER)
}

pub fn extract_steam_app_id(input: &str) -> Result<String, AdapterError> {
    let s = input.trim();

    if let Some(rest) = s.strip_prefix(STEAM_PREFIX) {
        let id = rest.trim();
        let valid = (2..=10).contains(&id.len()) && id.bytes().all(|b| b.is_ascii_digit());
        if !valid {
            return Err(AdapterError::Validation(format!(
                "invalid steam app id after {STEAM_PREFIX}: {id:?}"
            )));
        }
        return Ok(id.to_string());
    }

    s.match_indices("/app/")
        .map(|(idx, marker)| {
            s[idx + marker.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
        })
        .find(|digits| !digits.is_empty())
        .ok_or_else(|| {
            AdapterError::Validation(format!("not a steam url or steam:<appid>: {input}"))
        })
}

#[async_trait]
pub trait PagedSource: Send + Sync {
    /// Pages are independent; callers may fetch them in any order and in parallel.
    async fn fetch_page(
        &self,
        source_key: &str,
        page_size: usize,
        page_index: usize,
    ) -> Result<Vec<RawRecord>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorPage {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait CursorSource: Send + Sync {
    async fn fetch_page(
        &self,
        app_id: &str,
        cursor: &str,
        page_size: usize,
    ) -> Result<CursorPage, AdapterError>;
}

/// Both adapter kinds, resolved once at startup.
#[derive(Clone)]
pub struct SourceAdapters {
    pub paged: Arc<dyn PagedSource>,
    pub cursor: Arc<dyn CursorSource>,
}

impl SourceAdapters {
    pub fn new(paged: Arc<dyn PagedSource>, cursor: Arc<dyn CursorSource>) -> Self {
        Self { paged, cursor }
    }

    pub fn over_http(
        http: Arc<HttpFetcher>,
        stub_base_url: impl Into<String>,
        steam: SteamSettings,
    ) -> Self {
        Self {
            paged: Arc::new(StubPageAdapter::new(http.clone(), stub_base_url)),
            cursor: Arc::new(SteamCursorAdapter::new(http, steam)),
        }
    }
}

/// Wire shape served by `GET /stub/reviews`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StubRecord {
    pub author_name: String,
    pub rating: u8,
    pub text: String,
    pub created_at: NaiveDate,
}

impl TryFrom<StubRecord> for RawRecord {
    type Error = AdapterError;

    fn try_from(value: StubRecord) -> Result<Self, Self::Error> {
        if !(MIN_RATING..=MAX_RATING).contains(&value.rating) {
            return Err(AdapterError::Protocol(format!(
                "rating {} out of range {MIN_RATING}..={MAX_RATING}",
                value.rating
            )));
        }
        Ok(RawRecord::new(
            value.author_name,
            value.rating,
            value.text,
            value.created_at,
        ))
    }
}

/// `null` or an empty body count as an empty page.
pub fn decode_stub_page(body: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let records: Option<Vec<StubRecord>> = serde_json::from_slice(body)?;
    records
        .unwrap_or_default()
        .into_iter()
        .map(RawRecord::try_from)
        .collect()
}

#[derive(Debug, Clone)]
pub struct StubPageAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl StubPageAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn page_url(&self, source_key: &str, page_size: usize, page_index: usize) -> String {
        format!(
            "{}/stub/reviews?url={}&count={}&page={}",
            self.base_url,
            urlencoding::encode(source_key),
            page_size,
            page_index
        )
    }
}

#[async_trait]
impl PagedSource for StubPageAdapter {
    async fn fetch_page(
        &self,
        source_key: &str,
        page_size: usize,
        page_index: usize,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let url = self.page_url(source_key, page_size, page_index);
        let resp = self.http.fetch_bytes(&url).await?;
        let records = decode_stub_page(&resp.body)?;
        debug!(source_key, page_index, records = records.len(), "stub page fetched");
        Ok(records)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteamSettings {
    pub base_url: String,
    pub filter: String,
    pub language: String,
}

impl Default for SteamSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_STEAM_BASE_URL.to_string(),
            filter: "funny".to_string(),
            language: "russian".to_string(),
        }
    }
}

/// Blank means first page; anything else is decoded once then encoded once.
pub fn normalize_cursor(cursor: &str) -> String {
    if cursor.trim().is_empty() || cursor == FIRST_PAGE_CURSOR {
        return FIRST_PAGE_CURSOR.to_string();
    }
    let decoded = urlencoding::decode(cursor)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| cursor.to_string());
    urlencoding::encode(&decoded).into_owned()
}

#[derive(Debug, Deserialize)]
struct SteamEnvelope {
    #[serde(default)]
    success: i64,
    cursor: Option<String>,
    reviews: Option<Vec<SteamReview>>,
}

#[derive(Debug, Deserialize)]
struct SteamReview {
    review: Option<String>,
    #[serde(default)]
    timestamp_created: i64,
    voted_up: Option<bool>,
    author: Option<SteamAuthor>,
}

#[derive(Debug, Deserialize)]
struct SteamAuthor {
    steamid: Option<String>,
}

impl SteamReview {
    fn into_raw(self) -> Result<RawRecord, AdapterError> {
        let occurred_on = DateTime::from_timestamp(self.timestamp_created, 0)
            .ok_or_else(|| {
                AdapterError::Protocol(format!(
                    "timestamp_created out of range: {}",
                    self.timestamp_created
                ))
            })?
            .date_naive();
        let rating = if self.voted_up == Some(true) {
            MAX_RATING
        } else {
            MIN_RATING
        };
        let author = self
            .author
            .and_then(|a| a.steamid)
            .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());
        Ok(RawRecord::new(
            author,
            rating,
            self.review.unwrap_or_default(),
            occurred_on,
        ))
    }
}

/// Maps one `appreviews` response body into a page of raw records.
pub fn parse_steam_page(body: &[u8]) -> Result<CursorPage, AdapterError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(AdapterError::Protocol("steam returned an empty body".into()));
    }
    let envelope: Option<SteamEnvelope> = serde_json::from_slice(body)?;
    let Some(envelope) = envelope else {
        return Err(AdapterError::Protocol("steam returned null".into()));
    };
    if envelope.success != 1 {
        return Err(AdapterError::Protocol(format!(
            "steam returned success={}",
            envelope.success
        )));
    }
    let records = envelope
        .reviews
        .unwrap_or_default()
        .into_iter()
        .map(SteamReview::into_raw)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CursorPage {
        records,
        next_cursor: envelope.cursor,
    })
}

#[derive(Debug, Clone)]
pub struct SteamCursorAdapter {
    http: Arc<HttpFetcher>,
    settings: SteamSettings,
}

impl SteamCursorAdapter {
    pub fn new(http: Arc<HttpFetcher>, settings: SteamSettings) -> Self {
        Self { http, settings }
    }

    pub fn page_url(&self, app_id: &str, cursor: &str, page_size: usize) -> String {
        format!(
            "{}/appreviews/{}?json=1&filter={}&language={}&review_type=all&purchase_type=all&num_per_page={}&cursor={}",
            self.settings.base_url.trim_end_matches('/'),
            app_id,
            self.settings.filter,
            self.settings.language,
            page_size.clamp(1, MAX_STEAM_PAGE_SIZE),
            normalize_cursor(cursor)
        )
    }
}

#[async_trait]
impl CursorSource for SteamCursorAdapter {
    async fn fetch_page(
        &self,
        app_id: &str,
        cursor: &str,
        page_size: usize,
    ) -> Result<CursorPage, AdapterError> {
        let url = self.page_url(app_id, cursor, page_size);
        let resp = self.http.fetch_bytes(&url).await?;
        let page = parse_steam_page(&resp.body)?;
        debug!(app_id, records = page.records.len(), "steam page fetched");
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvh_storage::HttpClientConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn http() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap())
    }

    /// Answers one request with `body`; the handle yields the request line it saw.
    async fn serve_once(body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(resp.as_bytes()).await.unwrap();
            request.lines().next().unwrap_or_default().to_string()
        });
        (format!("http://{addr}/"), handle)
    }

    #[test]
    fn classify_routes_steam_inputs_to_cursor() {
        assert_eq!(
            SourceTarget::classify("  steam:570 ").unwrap(),
            SourceTarget::Cursor { app_id: "570".into() }
        );
        assert_eq!(
            SourceTarget::classify("https://store.steampowered.com/app/1091500/Cyberpunk_2077/").unwrap(),
            SourceTarget::Cursor { app_id: "1091500".into() }
        );
        assert_eq!(
            SourceTarget::classify(" https://x/a ").unwrap(),
            SourceTarget::Paged { source_key: "https://x/a".into() }
        );
    }

    #[test]
    fn classify_rejects_blank_and_bad_app_ids() {
        for input in ["", "   ", "steam:7", "steam:abc", "steam:12345678901", "steam:"] {
            assert!(
                matches!(SourceTarget::classify(input), Err(AdapterError::Validation(_))),
                "{input:?} should be rejected"
            );
        }
        assert!(matches!(
            SourceTarget::classify("https://store.steampowered.com/app/"),
            Err(AdapterError::Validation(_))
        ));
    }

    #[test]
    fn guard_key_collapses_steam_spellings() {
        let a = SourceTarget::classify("steam:570").unwrap();
        let b = SourceTarget::classify("https://store.steampowered.com/app/570/Dota_2").unwrap();
        assert_eq!(a.guard_key(), "steam:570");
        assert_eq!(a.guard_key(), b.guard_key());
        assert_eq!(
            SourceTarget::classify("https://x/a ").unwrap().guard_key(),
            "https://x/a"
        );
    }

    #[test]
    fn cursor_is_encoded_exactly_once() {
        assert_eq!(normalize_cursor(""), "*");
        assert_eq!(normalize_cursor("  "), "*");
        assert_eq!(normalize_cursor("*"), "*");
        assert_eq!(normalize_cursor("AoJ4+x/Q=="), "AoJ4%2Bx%2FQ%3D%3D");
        assert_eq!(normalize_cursor("AoJ4%2Bx%2FQ%3D%3D"), "AoJ4%2Bx%2FQ%3D%3D");
    }

    #[test]
    fn steam_page_url_clamps_page_size() {
        let adapter = SteamCursorAdapter::new(http(), SteamSettings::default());
        let url = adapter.page_url("570", "*", 500);
        assert_eq!(
            url,
            "https://store.steampowered.com/appreviews/570?json=1&filter=funny&language=russian&review_type=all&purchase_type=all&num_per_page=100&cursor=*"
        );
        assert!(adapter.page_url("570", "", 0).contains("num_per_page=1&cursor=*"));
    }

    #[test]
    fn stub_page_url_encodes_source_key() {
        let adapter = StubPageAdapter::new(http(), "http://127.0.0.1:8080/");
        assert_eq!(
            adapter.page_url("https://x/a?b=1", 5, 2),
            "http://127.0.0.1:8080/stub/reviews?url=https%3A%2F%2Fx%2Fa%3Fb%3D1&count=5&page=2"
        );
    }

    #[test]
    fn steam_mapping_applies_defaults() {
        let body = br#"{
            "success": 1,
            "cursor": "AoJ4next",
            "reviews": [
                {"review": "great", "timestamp_created": 1766188800, "voted_up": true, "author": {"steamid": "7656"}},
                {"timestamp_created": 1766188800, "voted_up": false},
                {"review": "meh", "timestamp_created": 1766188800, "author": {}}
            ]
        }"#;
        let page = parse_steam_page(body).unwrap();
        assert_eq!(page.next_cursor.as_deref(), Some("AoJ4next"));
        let date = NaiveDate::from_ymd_opt(2025, 12, 20).unwrap();
        assert_eq!(page.records[0], RawRecord::new("7656", 5, "great", date));
        assert_eq!(page.records[1], RawRecord::new("unknown", 1, "", date));
        assert_eq!(page.records[2], RawRecord::new("unknown", 1, "meh", date));
    }

    #[test]
    fn steam_protocol_failures() {
        assert!(matches!(parse_steam_page(b""), Err(AdapterError::Protocol(_))));
        assert!(matches!(parse_steam_page(b"null"), Err(AdapterError::Protocol(_))));
        assert!(matches!(
            parse_steam_page(br#"{"success": 2, "reviews": []}"#),
            Err(AdapterError::Protocol(_))
        ));
        assert!(matches!(parse_steam_page(b"<html>"), Err(AdapterError::Decode(_))));
    }

    #[test]
    fn steam_missing_reviews_is_an_empty_page() {
        let page = parse_steam_page(br#"{"success": 1, "cursor": "c"}"#).unwrap();
        assert!(page.records.is_empty());
    }

    #[test]
    fn stub_page_decoding() {
        let body = br#"[{"authorName": "user1234", "rating": 4, "text": "ok", "createdAt": "2025-12-20"}]"#;
        let records = decode_stub_page(body).unwrap();
        assert_eq!(
            records,
            vec![RawRecord::new("user1234", 4, "ok", NaiveDate::from_ymd_opt(2025, 12, 20).unwrap())]
        );
        assert!(decode_stub_page(b"null").unwrap().is_empty());
        assert!(decode_stub_page(b"").unwrap().is_empty());

        let bad = br#"[{"authorName": "u", "rating": 9, "text": "", "createdAt": "2025-12-20"}]"#;
        assert!(matches!(decode_stub_page(bad), Err(AdapterError::Protocol(_))));
    }

    #[tokio::test]
    async fn stub_adapter_fetches_and_decodes_a_page() {
        let (base, request) = serve_once(
            r#"[{"authorName":"ann","rating":4,"text":"fine","createdAt":"2025-12-20"},
                {"authorName":"bob","rating":1,"text":"bad","createdAt":"2025-12-21"}]"#,
        )
        .await;
        let adapter = StubPageAdapter::new(http(), base);

        let records = PagedSource::fetch_page(&adapter, "https://x/a", 2, 3)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].author, "ann");
        assert_eq!(records[1].rating, 1);
        assert_eq!(
            request.await.unwrap(),
            "GET /stub/reviews?url=https%3A%2F%2Fx%2Fa&count=2&page=3 HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn stub_adapter_rejects_out_of_range_ratings_from_the_wire() {
        let (base, _request) = serve_once(
            r#"[{"authorName":"ann","rating":9,"text":"x","createdAt":"2025-12-20"}]"#,
        )
        .await;
        let adapter = StubPageAdapter::new(http(), base);
        let err = PagedSource::fetch_page(&adapter, "https://x/a", 1, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Protocol(_)));
    }

    #[tokio::test]
    async fn steam_adapter_returns_records_and_next_cursor() {
        let (base, request) = serve_once(
            r#"{"success":1,"cursor":"AoJ4next","reviews":[{"review":"great","timestamp_created":1766188800,"voted_up":true,"author":{"steamid":"7656"}}]}"#,
        )
        .await;
        let settings = SteamSettings {
            base_url: base,
            ..SteamSettings::default()
        };
        let adapter = SteamCursorAdapter::new(http(), settings);

        let page = CursorSource::fetch_page(&adapter, "570", "*", 20)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("AoJ4next"));
        assert!(request
            .await
            .unwrap()
            .starts_with("GET /appreviews/570?json=1&filter=funny"));
    }
}
