//! Registry client.
//!
//! Issues paginated queries against the registry's study search endpoint
//! and turns each page into [`TrialRecord`]s.
//!
//! # Architecture
//!
//! ```text
//! QuerySpec ──► RegistryClient ──► PageStream::next_page()
//!                    │                    │
//!                    ▼                    ▼
//!              dyn PageFetcher      retry / dedup / cap
//!              (HttpFetcher)
//! ```
//!
//! [`PageFetcher`] is the transport seam: [`HttpFetcher`] talks to the
//! real registry, tests plug in scripted fetchers.
//!
//! # Retry
//!
//! Any non-success HTTP status and any transport error is retried up to
//! `registry.max_retries` times with exponential backoff
//! (`retry_backoff_ms`, doubled per attempt, capped at 32×). A response
//! that parses but lacks the `studies` array is malformed and fails the
//! page at once. A page that still fails ends the stream with a
//! [`RetrievalError`] naming the page, its token and `N/M` progress.
//!
//! # Pagination
//!
//! Successive pages are requested with the `nextPageToken` of the previous
//! response until a response carries none. The total reported through
//! `countTotal` only feeds progress reporting; the stream never relies on it.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RegistryConfig;
use crate::error::{HarvestError, RetrievalError};
use crate::models::TrialRecord;
use crate::study::parse_study;

// ═══════════════════════════════════════════════════════════════════════
// Query
// ═══════════════════════════════════════════════════════════════════════

/// Search terms, filters and the optional "modified since" bound of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub page_size: u32,
    pub sort: String,
    pub condition: Option<String>,
    pub term: Option<String>,
    pub overall_status: Vec<String>,
    /// Only studies last updated on or after this day.
    pub since: Option<NaiveDate>,
}

impl QuerySpec {
    pub fn from_config(registry: &RegistryConfig, since: Option<NaiveDate>) -> Self {
        Self {
            page_size: registry.page_size,
            sort: registry.sort.clone(),
            condition: registry.condition.clone(),
            term: registry.term.clone(),
            overall_status: registry.overall_status.clone(),
            since,
        }
    }

    /// Query-string parameters for one page request.
    pub fn params(&self, page_token: Option<&str>) -> Vec<(String, String)> {
        let mut params = vec![
            ("format".to_string(), "json".to_string()),
            ("pageSize".to_string(), self.page_size.to_string()),
            ("sort".to_string(), self.sort.clone()),
            ("countTotal".to_string(), "true".to_string()),
        ];
        if let Some(ref cond) = self.condition {
            params.push(("query.cond".to_string(), cond.clone()));
        }
        if let Some(ref term) = self.term {
            params.push(("query.term".to_string(), term.clone()));
        }
        if !self.overall_status.is_empty() {
            params.push((
                "filter.overallStatus".to_string(),
                self.overall_status.join(","),
            ));
        }
        if let Some(since) = self.since {
            params.push((
                "filter.advanced".to_string(),
                format!(
                    "AREA[LastUpdatePostDate]RANGE[{},MAX]",
                    since.format("%Y-%m-%d")
                ),
            ));
        }
        if let Some(token) = page_token {
            params.push(("pageToken".to_string(), token.to_string()));
        }
        params
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Transport seam
// ═══════════════════════════════════════════════════════════════════════

/// Why a single page request failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The registry answered with a non-success status.
    Status { status: u16, body: String },
    /// No usable response: connection failure, timeout, unreadable body.
    Transport(String),
    /// A readable response that is not a page of studies.
    Malformed(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Malformed(_))
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Status { status, body } if body.is_empty() => {
                write!(f, "HTTP {}", status)
            }
            FetchError::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
            FetchError::Transport(msg) => write!(f, "transport error: {}", msg),
            FetchError::Malformed(msg) => write!(f, "malformed response: {}", msg),
        }
    }
}

/// One page of raw registry output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPage {
    pub studies: Vec<Value>,
    pub next_page_token: Option<String>,
    pub total_count: Option<u64>,
}

/// Read the top level of a search response.
pub fn parse_page(body: &Value) -> Result<RawPage, FetchError> {
    let studies = body
        .get("studies")
        .and_then(Value::as_array)
        .ok_or_else(|| FetchError::Malformed("missing 'studies' array".to_string()))?
        .clone();
    let next_page_token = body
        .get("nextPageToken")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    let total_count = body.get("totalCount").and_then(Value::as_u64);
    Ok(RawPage {
        studies,
        next_page_token,
        total_count,
    })
}

/// Fetches one page for a set of query parameters.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, params: &[(String, String)]) -> Result<RawPage, FetchError>;
}

/// [`PageFetcher`] over HTTP(S) with a per-request timeout.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(registry: &RegistryConfig) -> Result<Self, HarvestError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(registry.timeout_secs))
            .user_agent(concat!("trial-harvest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HarvestError::config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: registry.base_url.clone(),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, params: &[(String, String)]) -> Result<RawPage, FetchError> {
        let response = self
            .client
            .get(&self.base_url)
            .query(params)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body: clip_body(text),
            });
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| FetchError::Transport(format!("invalid JSON body: {}", e)))?;
        parse_page(&json)
    }
}

/// Longest error body kept in a [`FetchError::Status`], in characters.
const ERROR_BODY_CHARS: usize = 200;

/// Shorten an error body without splitting a UTF-8 character.
fn clip_body(mut body: String) -> String {
    if let Some((cut, _)) = body.char_indices().nth(ERROR_BODY_CHARS) {
        body.truncate(cut);
    }
    body
}

// ═══════════════════════════════════════════════════════════════════════
// Client and stream
// ═══════════════════════════════════════════════════════════════════════

/// A query bound to a fetcher and the retry policy.
pub struct RegistryClient {
    fetcher: Arc<dyn PageFetcher>,
    query: QuerySpec,
    max_retries: u32,
    backoff: Duration,
    max_records: Option<usize>,
}

impl RegistryClient {
    pub fn new(fetcher: Arc<dyn PageFetcher>, query: QuerySpec, registry: &RegistryConfig) -> Self {
        Self {
            fetcher,
            query,
            max_retries: registry.max_retries,
            backoff: Duration::from_millis(registry.retry_backoff_ms),
            max_records: registry.max_records,
        }
    }

    pub fn query(&self) -> &QuerySpec {
        &self.query
    }

    /// Start reading the query from its first page.
    ///
    /// Every call starts over; a failed stream is retried by calling this
    /// again.
    pub fn pages(&self) -> PageStream<'_> {
        PageStream {
            client: self,
            next_token: None,
            done: false,
            pages_completed: 0,
            total_count: None,
            seen: HashSet::new(),
            records: 0,
            duplicates: 0,
            truncated: false,
        }
    }

    async fn fetch_page(&self, token: Option<&str>) -> Result<RawPage, FailedFetch> {
        let params = self.query.params(token);
        let mut attempt = 0;
        let mut last_status = None;
        loop {
            attempt += 1;
            let result = self.fetcher.fetch(&params).await;
            if let Err(ref e) = result {
                if let Some(status) = e.status() {
                    last_status = Some(status);
                }
            }
            match result {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "page request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(FailedFetch {
                        error,
                        attempts: attempt,
                        last_status,
                    })
                }
            }
        }
    }
}

/// Final error of a page after its retries, plus what earlier attempts saw.
struct FailedFetch {
    error: FetchError,
    attempts: u32,
    /// Most recent HTTP status across all attempts.
    last_status: Option<u16>,
}

/// One retrieved page, already flattened into records.
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based page number.
    pub number: u32,
    pub records: Vec<TrialRecord>,
}

/// Lazy, finite sequence of pages for one query.
///
/// Records repeated across pages are yielded once, at their first
/// occurrence. When `registry.max_records` is reached the stream stops
/// early and [`truncated`](PageStream::truncated) reports it.
pub struct PageStream<'a> {
    client: &'a RegistryClient,
    next_token: Option<String>,
    done: bool,
    pages_completed: u32,
    total_count: Option<u64>,
    seen: HashSet<String>,
    records: usize,
    duplicates: usize,
    truncated: bool,
}

impl<'a> PageStream<'a> {
    /// Fetch the next page, or `None` once the registry reports no more.
    pub async fn next_page(&mut self) -> Result<Option<Page>, RetrievalError> {
        if self.done {
            return Ok(None);
        }

        let number = self.pages_completed + 1;
        let token = self.next_token.clone();
        let raw = self
            .client
            .fetch_page(token.as_deref())
            .await
            .map_err(|failed| RetrievalError {
                page: number,
                page_token: token.clone(),
                pages_completed: self.pages_completed,
                pages_expected: self.pages_expected(),
                last_status: failed.last_status,
                attempts: failed.attempts,
                reason: failed.error.to_string(),
            })?;

        if raw.total_count.is_some() {
            self.total_count = raw.total_count;
        }
        if raw.next_page_token.is_some() && raw.next_page_token == token {
            return Err(RetrievalError {
                page: number,
                page_token: token,
                pages_completed: self.pages_completed,
                pages_expected: self.pages_expected(),
                last_status: None,
                attempts: 1,
                reason: "registry returned the same page token again".to_string(),
            });
        }

        let mut records = Vec::with_capacity(raw.studies.len());
        for study in &raw.studies {
            if self.at_cap() {
                self.truncated = true;
                break;
            }
            let record = parse_study(study);
            if let Some(ref id) = record.nct_id {
                if !self.seen.insert(id.clone()) {
                    self.duplicates += 1;
                    tracing::warn!(nct_id = %id, page = number, "study repeated across pages");
                    continue;
                }
            }
            self.records += 1;
            records.push(record);
        }

        self.pages_completed = number;
        self.next_token = raw.next_page_token;
        if self.next_token.is_none() {
            self.done = true;
        } else if self.at_cap() {
            self.truncated = true;
            self.done = true;
        }

        tracing::debug!(
            page = number,
            records = records.len(),
            more = !self.done,
            "page retrieved"
        );

        Ok(Some(Page { number, records }))
    }

    fn at_cap(&self) -> bool {
        self.client
            .max_records
            .is_some_and(|cap| self.records >= cap)
    }

    pub fn pages_completed(&self) -> u32 {
        self.pages_completed
    }

    /// Page count implied by the registry's reported total, if any.
    pub fn pages_expected(&self) -> Option<u32> {
        let page_size = u64::from(self.client.query.page_size.max(1));
        self.total_count
            .map(|total| total.div_ceil(page_size).max(1) as u32)
    }

    pub fn total_count(&self) -> Option<u64> {
        self.total_count
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Whether the record cap cut the query short.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves a fixed script of responses and records every request.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<RawPage, FetchError>>>,
        requests: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<RawPage, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn tokens(&self) -> Vec<Option<String>> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|params| {
                    params
                        .iter()
                        .find(|(k, _)| k == "pageToken")
                        .map(|(_, v)| v.clone())
                })
                .collect()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(&self, params: &[(String, String)]) -> Result<RawPage, FetchError> {
            self.requests.lock().unwrap().push(params.to_vec());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Transport("script exhausted".into())))
        }
    }

    fn study(id: &str) -> Value {
        json!({ "protocolSection": { "identificationModule": { "nctId": id } } })
    }

    fn page(ids: &[&str], next: Option<&str>, total: Option<u64>) -> Result<RawPage, FetchError> {
        Ok(RawPage {
            studies: ids.iter().map(|id| study(id)).collect(),
            next_page_token: next.map(str::to_string),
            total_count: total,
        })
    }

    fn registry(max_retries: u32) -> RegistryConfig {
        RegistryConfig {
            page_size: 2,
            max_retries,
            retry_backoff_ms: 0,
            ..Default::default()
        }
    }

    fn client(fetcher: Arc<ScriptedFetcher>, config: &RegistryConfig) -> RegistryClient {
        RegistryClient::new(fetcher, QuerySpec::from_config(config, None), config)
    }

    async fn drain(stream: &mut PageStream<'_>) -> Result<Vec<String>, RetrievalError> {
        let mut ids = Vec::new();
        while let Some(page) = stream.next_page().await? {
            ids.extend(page.records.into_iter().filter_map(|r| r.nct_id));
        }
        Ok(ids)
    }

    #[tokio::test]
    async fn follows_page_tokens_until_exhausted() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&["NCT1", "NCT2"], Some("t2"), Some(5)),
            page(&["NCT3", "NCT4"], Some("t3"), None),
            page(&["NCT5"], None, None),
        ]);
        let config = registry(0);
        let client = client(fetcher.clone(), &config);
        let mut stream = client.pages();

        let ids = drain(&mut stream).await.unwrap();
        assert_eq!(ids, vec!["NCT1", "NCT2", "NCT3", "NCT4", "NCT5"]);
        assert_eq!(stream.pages_completed(), 3);
        assert_eq!(stream.pages_expected(), Some(3));
        assert_eq!(
            fetcher.tokens(),
            vec![None, Some("t2".into()), Some("t3".into())]
        );
    }

    #[tokio::test]
    async fn transient_failures_are_retried_without_loss() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&["NCT1", "NCT2"], Some("t2"), None),
            Err(FetchError::Status {
                status: 503,
                body: String::new(),
            }),
            Err(FetchError::Transport("connection reset".into())),
            page(&["NCT3"], None, None),
        ]);
        let config = registry(3);
        let client = client(fetcher.clone(), &config);

        let ids = drain(&mut client.pages()).await.unwrap();
        assert_eq!(ids, vec!["NCT1", "NCT2", "NCT3"]);
        assert_eq!(fetcher.tokens().len(), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_report_progress() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&["NCT1", "NCT2"], Some("t2"), Some(6)),
            page(&["NCT3", "NCT4"], Some("t3"), Some(6)),
            Err(FetchError::Status {
                status: 500,
                body: "boom".into(),
            }),
            Err(FetchError::Status {
                status: 502,
                body: String::new(),
            }),
        ]);
        let config = registry(1);
        let client = client(fetcher, &config);
        let mut stream = client.pages();

        let err = drain(&mut stream).await.unwrap_err();
        assert_eq!(err.page, 3);
        assert_eq!(err.page_token.as_deref(), Some("t3"));
        assert_eq!(err.pages_completed, 2);
        assert_eq!(err.progress(), "2/3");
        assert_eq!(err.last_status, Some(502));
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test]
    async fn status_survives_a_later_transport_failure() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::Status {
                status: 503,
                body: "maintenance".into(),
            }),
            Err(FetchError::Transport("timed out".into())),
        ]);
        let config = registry(1);
        let client = client(fetcher, &config);

        let err = client.pages().next_page().await.unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.last_status, Some(503));
        assert!(err.reason.contains("timed out"));
    }

    #[test]
    fn error_body_clipped_on_char_boundary() {
        let body = format!("{}é tail", "a".repeat(199));
        let clipped = clip_body(body);
        assert_eq!(clipped.chars().count(), ERROR_BODY_CHARS);
        assert!(clipped.ends_with('é'));

        assert_eq!(clip_body("short".into()), "short");
    }

    #[tokio::test]
    async fn multibyte_error_page_is_a_status_error() {
        use axum::http::StatusCode;
        use axum::routing::get;
        use axum::Router;

        let app = Router::new().route(
            "/studies",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, format!("{}é", "a".repeat(199))) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = RegistryConfig {
            base_url: format!("http://{}/studies", addr),
            timeout_secs: 5,
            ..Default::default()
        };
        let fetcher = HttpFetcher::new(&config).unwrap();
        match fetcher.fetch(&[]).await {
            Err(FetchError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert!(body.ends_with('é'));
            }
            other => panic!("expected a status error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn malformed_page_is_not_retried() {
        let fetcher = ScriptedFetcher::new(vec![Err(FetchError::Malformed(
            "missing 'studies' array".into(),
        ))]);
        let config = registry(5);
        let client = client(fetcher.clone(), &config);

        let err = client.pages().next_page().await.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.progress(), "0/?");
        assert_eq!(fetcher.tokens().len(), 1);
    }

    #[tokio::test]
    async fn records_repeated_across_pages_yield_once() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&["NCT1", "NCT2"], Some("t2"), None),
            page(&["NCT2", "NCT3"], None, None),
        ]);
        let config = registry(0);
        let client = client(fetcher, &config);
        let mut stream = client.pages();

        assert_eq!(
            drain(&mut stream).await.unwrap(),
            vec!["NCT1", "NCT2", "NCT3"]
        );
        assert_eq!(stream.duplicates(), 1);
    }

    #[tokio::test]
    async fn record_cap_truncates_stream() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&["NCT1", "NCT2"], Some("t2"), None),
            page(&["NCT3", "NCT4"], Some("t3"), None),
        ]);
        let config = RegistryConfig {
            max_records: Some(3),
            ..registry(0)
        };
        let client = client(fetcher.clone(), &config);
        let mut stream = client.pages();

        assert_eq!(
            drain(&mut stream).await.unwrap(),
            vec!["NCT1", "NCT2", "NCT3"]
        );
        assert!(stream.truncated());
        assert_eq!(fetcher.tokens().len(), 2);
    }

    #[tokio::test]
    async fn repeated_page_token_fails() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&["NCT1"], Some("t2"), None),
            page(&["NCT2"], Some("t2"), None),
        ]);
        let config = registry(0);
        let client = client(fetcher, &config);
        let err = drain(&mut client.pages()).await.unwrap_err();
        assert_eq!(err.page, 2);
        assert!(err.reason.contains("same page token"));
    }

    #[tokio::test]
    async fn stream_restarts_from_first_page() {
        let fetcher = ScriptedFetcher::new(vec![
            page(&["NCT1"], Some("t2"), None),
            Err(FetchError::Transport("down".into())),
            page(&["NCT1"], Some("t2"), None),
            page(&["NCT2"], None, None),
        ]);
        let config = registry(0);
        let client = client(fetcher.clone(), &config);

        assert!(drain(&mut client.pages()).await.is_err());
        assert_eq!(
            drain(&mut client.pages()).await.unwrap(),
            vec!["NCT1", "NCT2"]
        );
        assert_eq!(fetcher.tokens()[2], None);
    }

    #[test]
    fn query_parameters() {
        let config = RegistryConfig {
            page_size: 500,
            condition: Some("diabetes".into()),
            overall_status: vec!["RECRUITING".into(), "COMPLETED".into()],
            ..Default::default()
        };
        let since = NaiveDate::from_ymd_opt(2024, 5, 1);
        let params = QuerySpec::from_config(&config, since).params(Some("tok"));
        let get = |k: &str| {
            params
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("format"), Some("json"));
        assert_eq!(get("pageSize"), Some("500"));
        assert_eq!(get("countTotal"), Some("true"));
        assert_eq!(get("query.cond"), Some("diabetes"));
        assert_eq!(get("query.term"), None);
        assert_eq!(get("filter.overallStatus"), Some("RECRUITING,COMPLETED"));
        assert_eq!(
            get("filter.advanced"),
            Some("AREA[LastUpdatePostDate]RANGE[2024-05-01,MAX]")
        );
        assert_eq!(get("pageToken"), Some("tok"));
    }

    #[test]
    fn page_parsing() {
        let raw = parse_page(&json!({
            "studies": [study("NCT1")],
            "nextPageToken": "abc",
            "totalCount": 10
        }))
        .unwrap();
        assert_eq!(raw.studies.len(), 1);
        assert_eq!(raw.next_page_token.as_deref(), Some("abc"));
        assert_eq!(raw.total_count, Some(10));

        let last = parse_page(&json!({ "studies": [] })).unwrap();
        assert_eq!(last.next_page_token, None);

        let err = parse_page(&json!({ "error": "nope" })).unwrap_err();
        assert!(!err.is_retryable());
    }
}
