use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::{
    classify_reqwest_error, jittered, BackoffPolicy, RetryDisposition, RetryPolicy,
    SimpleTokenBucket, TokenBucketConfig,
};

/// Field names that may hold the listings array, highest priority first.
pub const LISTING_KEYS: [&str; 4] = ["jobPosts", "jobs", "items", "results"];

const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub endpoint: String,
    pub page_size: u32,
    pub filters: JsonValue,
    /// Extra keys merged into every request body.
    pub extra_payload: Map<String, JsonValue>,
    pub bearer_token: Option<String>,
    pub user_agent: Option<String>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub request_interval: Option<Duration>,
    pub rate_limit_default_delay: Duration,
    /// 429 responses tolerated per page; they do not use up `backoff` attempts.
    pub max_rate_limit_waits: u32,
    pub backoff: BackoffPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/api/jobs".to_string(),
            page_size: 100,
            filters: json!({}),
            extra_payload: Map::new(),
            bearer_token: None,
            user_agent: Some(format!("jobstream/{}", env!("CARGO_PKG_VERSION"))),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(20),
            max_concurrent_requests: 3,
            request_interval: None,
            rate_limit_default_delay: Duration::from_secs(60),
            max_rate_limit_waits: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub page: u32,
    pub listings: Vec<JsonValue>,
    pub has_next_page: Option<bool>,
}

impl PageResult {
    /// True when the upstream signalled the end of the stream.
    pub fn is_last(&self) -> bool {
        self.listings.is_empty() || self.has_next_page == Some(false)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error on page {page}: {source}")]
    Transport {
        page: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("rate limited on page {page}; waited {waited:?}")]
    RateLimited { page: u32, waited: Duration },
    #[error("upstream rejected credentials (http 401) on page {page}")]
    Unauthorized { page: u32 },
    #[error("upstream server error {status} on page {page}")]
    Server { page: u32, status: u16 },
    #[error("upstream client error {status} on page {page}")]
    Client { page: u32, status: u16 },
    #[error("malformed json on page {page}: {message}")]
    Decode {
        page: u32,
        message: String,
        snippet: String,
    },
    #[error("unexpected response structure on page {page}: {detail}")]
    UnexpectedShape { page: u32, detail: String },
    #[error("fetcher is shut down")]
    Shutdown,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transport { source, .. } => classify_reqwest_error(source),
            Self::RateLimited { .. }
            | Self::Server { .. }
            | Self::Decode { .. }
            | Self::UnexpectedShape { .. } => RetryDisposition::Retryable,
            Self::Unauthorized { .. } | Self::Client { .. } | Self::Shutdown => {
                RetryDisposition::NonRetryable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }

    /// Errors that must abort the whole run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    pub fn page(&self) -> Option<u32> {
        match self {
            Self::Transport { page, .. }
            | Self::RateLimited { page, .. }
            | Self::Unauthorized { page }
            | Self::Server { page, .. }
            | Self::Client { page, .. }
            | Self::Decode { page, .. }
            | Self::UnexpectedShape { page, .. } => Some(*page),
            Self::Shutdown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Server { .. } => "server_error",
            Self::Client { .. } => "client_error",
            Self::Decode { .. } => "decode",
            Self::UnexpectedShape { .. } => "unexpected_shape",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Issues paginated POST requests against the listings endpoint.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    config: FetchConfig,
    limit: Arc<Semaphore>,
    token_bucket: Option<SimpleTokenBucket>,
    retry: RetryPolicy,
}

struct RawResponse {
    status: StatusCode,
    retry_after: Option<Duration>,
    body: Vec<u8>,
}

impl PageFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &config.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("building authorization header")?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .request_interval
            .filter(|interval| !interval.is_zero())
            .map(|refill_every| {
                SimpleTokenBucket::new(TokenBucketConfig {
                    capacity: 1,
                    refill_every,
                })
            });

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            token_bucket,
            retry: RetryPolicy::new(config.backoff),
            config,
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn payload(&self, page: u32) -> JsonValue {
        let mut body = self.config.extra_payload.clone();
        body.insert("page".into(), json!(page));
        body.insert("pageSize".into(), json!(self.config.page_size));
        body.insert("filters".into(), self.config.filters.clone());
        body.insert("nextPageToken".into(), JsonValue::Null);
        JsonValue::Object(body)
    }

    /// Fetches one page with the configured retry policy. Rate-limit waits
    /// are counted separately and each one starts a fresh attempt budget.
    pub async fn fetch_with_retry(&self, page: u32) -> Result<PageResult, FetchError> {
        let mut rate_limited = 0u32;
        loop {
            let result = self
                .retry
                .run(
                    "page_fetch",
                    |_| self.fetch(page),
                    |err, _| match err {
                        FetchError::RateLimited { .. } => RetryDisposition::NonRetryable,
                        err => err.disposition(),
                    },
                )
                .await;
            match result {
                Err(FetchError::RateLimited { .. })
                    if rate_limited < self.config.max_rate_limit_waits =>
                {
                    rate_limited += 1;
                    debug!(page, rate_limited, "rate-limit window elapsed; retrying page");
                }
                other => return other,
            }
        }
    }

    /// Single attempt. A 429 sleeps the jittered `Retry-After` delay before
    /// returning so the caller's retry goes out after the window.
    pub async fn fetch(&self, page: u32) -> Result<PageResult, FetchError> {
        let span = info_span!("page_fetch", page, endpoint = %self.config.endpoint);
        async move {
            let raw = self.send(page).await?;
            match raw.status {
                status if status.is_success() => self.parse_body(page, &raw.body),
                StatusCode::TOO_MANY_REQUESTS => {
                    let base = raw
                        .retry_after
                        .unwrap_or(self.config.rate_limit_default_delay);
                    let waited = jittered(base);
                    warn!(
                        retry_after_secs = base.as_secs_f64(),
                        wait_secs = waited.as_secs_f64(),
                        "rate limited by upstream"
                    );
                    tokio::time::sleep(waited).await;
                    Err(FetchError::RateLimited { page, waited })
                }
                StatusCode::UNAUTHORIZED => {
                    error!("upstream rejected credentials");
                    Err(FetchError::Unauthorized { page })
                }
                status if status.is_server_error() => {
                    warn!(status = status.as_u16(), "upstream server error");
                    Err(FetchError::Server {
                        page,
                        status: status.as_u16(),
                    })
                }
                status => {
                    warn!(status = status.as_u16(), "upstream refused page");
                    Err(FetchError::Client {
                        page,
                        status: status.as_u16(),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn send(&self, page: u32) -> Result<RawResponse, FetchError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let response = self
            .client
            .post(&self.config.endpoint)
            .json(&self.payload(page))
            .send()
            .await
            .map_err(|source| FetchError::Transport { page, source })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response
            .bytes()
            .await
            .map_err(|source| FetchError::Transport { page, source })?
            .to_vec();

        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }

    fn parse_body(&self, page: u32, body: &[u8]) -> Result<PageResult, FetchError> {
        let value: JsonValue = serde_json::from_slice(body).map_err(|err| {
            let snippet = body_snippet(body);
            warn!(error = %err, snippet = %snippet, "response body is not valid json");
            FetchError::Decode {
                page,
                message: err.to_string(),
                snippet,
            }
        })?;

        let (listings, has_next_page) = extract_listings(&value).map_err(|detail| {
            warn!(detail = %detail, "response has no listings array");
            FetchError::UnexpectedShape { page, detail }
        })?;

        Ok(PageResult {
            page,
            listings,
            has_next_page,
        })
    }
}

/// Pulls the listings array and the continuation flag out of a response body.
///
/// Both are looked up in a `data` object when one is present, else at the
/// root. Candidates from [`LISTING_KEYS`] are tried in order and the first
/// present, non-null one wins.
pub fn extract_listings(body: &JsonValue) -> Result<(Vec<JsonValue>, Option<bool>), String> {
    let envelope = match body.get("data") {
        Some(data) if data.is_object() => data,
        _ => body,
    };

    let has_next_page = envelope
        .get("hasNextPage")
        .or_else(|| body.get("hasNextPage"))
        .and_then(JsonValue::as_bool);

    let found = LISTING_KEYS
        .iter()
        .find_map(|key| envelope.get(*key).filter(|v| !v.is_null()).map(|v| (*key, v)));

    match found {
        Some((_, JsonValue::Array(items))) => Ok((items.clone(), has_next_page)),
        Some((key, other)) => Err(format!(
            "field `{key}` is {} instead of an array",
            json_type_name(other)
        )),
        None => match body.get("error") {
            Some(err) => Err(format!("upstream returned error payload: {err}")),
            None => Err(format!(
                "none of the listing fields {LISTING_KEYS:?} is present"
            )),
        },
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

fn body_snippet(body: &[u8]) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(SNIPPET_CHARS)
        .collect()
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::header::{CONTENT_TYPE, RETRY_AFTER as RETRY_AFTER_HEADER};
    use axum::http::{HeaderValue as AxumHeaderValue, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::Router;

    #[derive(Clone)]
    struct Canned {
        status: AxumStatus,
        retry_after: Option<&'static str>,
        body: String,
    }

    impl Canned {
        fn ok(body: JsonValue) -> Self {
            Self {
                status: AxumStatus::OK,
                retry_after: None,
                body: body.to_string(),
            }
        }

        fn status(status: AxumStatus) -> Self {
            Self {
                status,
                retry_after: None,
                body: "{}".to_string(),
            }
        }

        fn raw(body: &str) -> Self {
            Self {
                status: AxumStatus::OK,
                retry_after: None,
                body: body.to_string(),
            }
        }
    }

    #[derive(Default)]
    struct Script {
        responses: Vec<Canned>,
        hits: AtomicUsize,
        hit_times: StdMutex<Vec<Instant>>,
        bodies: StdMutex<Vec<JsonValue>>,
    }

    async fn scripted(State(script): State<Arc<Script>>, body: Bytes) -> Response {
        let idx = script.hits.fetch_add(1, Ordering::SeqCst);
        script.hit_times.lock().unwrap().push(Instant::now());
        if let Ok(value) = serde_json::from_slice::<JsonValue>(&body) {
            script.bodies.lock().unwrap().push(value);
        }
        let canned = script
            .responses
            .get(idx)
            .or(script.responses.last())
            .cloned()
            .unwrap();
        let mut response = (canned.status, canned.body).into_response();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, AxumHeaderValue::from_static("application/json"));
        if let Some(value) = canned.retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER_HEADER, AxumHeaderValue::from_static(value));
        }
        response
    }

    async fn spawn_upstream(responses: Vec<Canned>) -> (String, Arc<Script>) {
        let script = Arc::new(Script {
            responses,
            ..Script::default()
        });
        let app = Router::new()
            .route("/jobs", post(scripted))
            .with_state(script.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/jobs"), script)
    }

    fn fetcher_for(endpoint: String) -> PageFetcher {
        PageFetcher::new(FetchConfig {
            endpoint,
            page_size: 25,
            filters: json!({"province": "tehran"}),
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
            },
            ..FetchConfig::default()
        })
        .unwrap()
    }

    fn page_body(ids: &[&str], has_next: bool) -> JsonValue {
        let posts: Vec<JsonValue> = ids.iter().map(|id| json!({"id": id})).collect();
        json!({"data": {"jobPosts": posts, "hasNextPage": has_next}})
    }

    #[test]
    fn listing_candidates_are_checked_in_priority_order() {
        let body = json!({"data": {"items": [1], "jobPosts": [1, 2]}});
        let (listings, has_next) = extract_listings(&body).unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(has_next, None);

        let body = json!({"data": {"jobPosts": null, "results": [1, 2, 3]}, "hasNextPage": true});
        let (listings, has_next) = extract_listings(&body).unwrap();
        assert_eq!(listings.len(), 3);
        assert_eq!(has_next, Some(true));

        let body = json!({"jobs": [{"id": "a"}]});
        assert_eq!(extract_listings(&body).unwrap().0.len(), 1);
    }

    #[test]
    fn missing_or_mistyped_listings_are_shape_errors() {
        assert!(extract_listings(&json!({"data": {}})).is_err());
        assert!(extract_listings(&json!({"jobs": "nope"})).is_err());
        let err = extract_listings(&json!({"error": "quota"})).unwrap_err();
        assert!(err.contains("quota"));
    }

    #[test]
    fn empty_or_flagged_pages_end_the_stream() {
        let last = PageResult {
            page: 3,
            listings: vec![json!({})],
            has_next_page: Some(false),
        };
        assert!(last.is_last());
        let empty = PageResult {
            page: 4,
            listings: Vec::new(),
            has_next_page: None,
        };
        assert!(empty.is_last());
        let more = PageResult {
            page: 1,
            listings: vec![json!({})],
            has_next_page: None,
        };
        assert!(!more.is_last());
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(" 1.5 "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test]
    async fn request_body_carries_page_size_and_filters() {
        let (endpoint, script) = spawn_upstream(vec![Canned::ok(page_body(&["a"], true))]).await;
        let fetcher = fetcher_for(endpoint);

        let page = fetcher.fetch_with_retry(4).await.unwrap();
        assert_eq!(page.listings.len(), 1);
        assert_eq!(page.has_next_page, Some(true));

        let bodies = script.bodies.lock().unwrap();
        assert_eq!(bodies[0]["page"], json!(4));
        assert_eq!(bodies[0]["pageSize"], json!(25));
        assert_eq!(bodies[0]["filters"]["province"], json!("tehran"));
        assert!(bodies[0]["nextPageToken"].is_null());
    }

    #[tokio::test]
    async fn rate_limit_waits_for_jittered_retry_after() {
        let (endpoint, script) = spawn_upstream(vec![
            Canned {
                status: AxumStatus::TOO_MANY_REQUESTS,
                retry_after: Some("2"),
                body: "{}".into(),
            },
            Canned::ok(page_body(&["a", "b"], false)),
        ])
        .await;
        let fetcher = fetcher_for(endpoint);

        let page = fetcher.fetch_with_retry(1).await.unwrap();
        assert_eq!(page.listings.len(), 2);

        let times = script.hit_times.lock().unwrap();
        assert_eq!(times.len(), 2);
        // lower bound of the 0.5x jitter on a 2s Retry-After
        assert!(times[1].duration_since(times[0]) >= Duration::from_secs(1));
    }

    fn throttled() -> Canned {
        Canned {
            status: AxumStatus::TOO_MANY_REQUESTS,
            retry_after: Some("0"),
            body: "{}".into(),
        }
    }

    #[tokio::test]
    async fn rate_limits_do_not_use_up_the_attempt_budget() {
        let (endpoint, script) = spawn_upstream(vec![
            throttled(),
            throttled(),
            throttled(),
            Canned::ok(page_body(&["a"], false)),
        ])
        .await;
        // max_retries is 2, so three attempts; the 429s must not count
        let fetcher = fetcher_for(endpoint);

        let page = fetcher.fetch_with_retry(1).await.unwrap();
        assert_eq!(page.listings.len(), 1);
        assert_eq!(script.hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn sustained_rate_limiting_gives_up_after_the_wait_cap() {
        let (endpoint, script) = spawn_upstream(vec![throttled()]).await;
        let fetcher = PageFetcher::new(FetchConfig {
            max_rate_limit_waits: 2,
            ..fetcher_for(endpoint).config().clone()
        })
        .unwrap();

        let err = fetcher.fetch_with_retry(1).await.unwrap_err();
        assert!(matches!(err, FetchError::RateLimited { page: 1, .. }));
        assert_eq!(script.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unauthorized_is_terminal_and_not_retried() {
        let (endpoint, script) = spawn_upstream(vec![Canned::status(AxumStatus::UNAUTHORIZED)]).await;
        let fetcher = fetcher_for(endpoint);

        let err = fetcher.fetch_with_retry(1).await.unwrap_err();
        assert!(err.is_terminal());
        assert!(matches!(err, FetchError::Unauthorized { page: 1 }));
        assert_eq!(script.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let (endpoint, script) = spawn_upstream(vec![
            Canned::status(AxumStatus::SERVICE_UNAVAILABLE),
            Canned::status(AxumStatus::BAD_GATEWAY),
            Canned::ok(page_body(&["a"], true)),
        ])
        .await;
        let fetcher = fetcher_for(endpoint);

        let page = fetcher.fetch_with_retry(2).await.unwrap();
        assert_eq!(page.page, 2);
        assert_eq!(script.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_client_errors_skip_the_page_without_retry() {
        let (endpoint, script) = spawn_upstream(vec![Canned::status(AxumStatus::NOT_FOUND)]).await;
        let fetcher = fetcher_for(endpoint);

        let err = fetcher.fetch_with_retry(9).await.unwrap_err();
        assert!(matches!(err, FetchError::Client { page: 9, status: 404 }));
        assert!(!err.is_terminal());
        assert_eq!(script.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_retried_and_reports_a_bounded_snippet() {
        let garbage = format!("<html>{}</html>", "x".repeat(500));
        let (endpoint, script) = spawn_upstream(vec![Canned::raw(&garbage)]).await;
        let fetcher = fetcher_for(endpoint);

        let err = fetcher.fetch_with_retry(1).await.unwrap_err();
        match err {
            FetchError::Decode { snippet, .. } => {
                assert_eq!(snippet.chars().count(), 200);
                assert!(snippet.starts_with("<html>"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(script.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn malformed_json_then_valid_body_succeeds() {
        let (endpoint, script) = spawn_upstream(vec![
            Canned::raw("{not json"),
            Canned::ok(page_body(&["a"], true)),
        ])
        .await;
        let fetcher = fetcher_for(endpoint);

        assert!(fetcher.fetch_with_retry(1).await.is_ok());
        assert_eq!(script.hits.load(Ordering::SeqCst), 2);
    }
}
