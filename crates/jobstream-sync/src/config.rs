use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use jobstream_records::{DEFAULT_MAX_DESCRIPTION_LEN, DEFAULT_SOURCE_NAME};
use jobstream_storage::{BackoffPolicy, FetchConfig};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

/// Runtime parameters for a run, read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    pub user_agent: String,
    pub page_size: u32,
    pub filters: JsonValue,
    pub extra_payload: Map<String, JsonValue>,
    pub max_pages: Option<u32>,
    pub max_concurrent_requests: usize,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_interval_ms: u64,
    pub rate_limit_default_secs: u64,
    pub max_rate_limit_waits: u32,
    pub fetch_retries: usize,
    pub fetch_backoff_ms: u64,
    pub fetch_backoff_max_ms: u64,
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub database_url: Option<String>,
    pub db_enabled: bool,
    pub db_max_connections: u32,
    pub db_retries: usize,
    pub db_backoff_ms: u64,
    pub db_backoff_max_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub max_consumer_errors: u32,
    pub max_failed_pages: usize,
    pub run_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Start from the previous run's last page minus `lookback_pages`.
    pub resume: bool,
    pub lookback_pages: u32,
    /// Saved progress older than this is ignored and the run starts at page 1.
    pub max_resume_age_secs: u64,
    pub data_dir: PathBuf,
    pub source_name: String,
    pub max_description_len: usize,
    pub upsert_chunk_size: usize,
    pub tag_rules_path: Option<PathBuf>,
    pub schedule_cron: String,
    pub export_tabular: bool,
    pub auto_migrate: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/api/jobs".to_string(),
            api_token: None,
            user_agent: format!("jobstream/{}", env!("CARGO_PKG_VERSION")),
            page_size: 100,
            filters: JsonValue::Object(Map::new()),
            extra_payload: Map::new(),
            max_pages: None,
            max_concurrent_requests: 3,
            request_timeout_secs: 60,
            connect_timeout_secs: 20,
            request_interval_ms: 0,
            rate_limit_default_secs: 60,
            max_rate_limit_waits: 10,
            fetch_retries: 2,
            fetch_backoff_ms: 1_000,
            fetch_backoff_max_ms: 10_000,
            batch_size: 100,
            queue_capacity: 10,
            database_url: None,
            db_enabled: true,
            db_max_connections: 10,
            db_retries: 2,
            db_backoff_ms: 1_000,
            db_backoff_max_ms: 30_000,
            circuit_breaker_threshold: 5,
            max_consumer_errors: 5,
            max_failed_pages: 10,
            run_timeout_secs: 3_600,
            shutdown_grace_secs: 10,
            resume: true,
            lookback_pages: 5,
            max_resume_age_secs: 86_400,
            data_dir: PathBuf::from("./job_data"),
            source_name: DEFAULT_SOURCE_NAME.to_string(),
            max_description_len: DEFAULT_MAX_DESCRIPTION_LEN,
            upsert_chunk_size: 500,
            tag_rules_path: None,
            schedule_cron: "0 */30 * * * *".to_string(),
            export_tabular: true,
            auto_migrate: true,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty());
        Self {
            api_url: std::env::var("JOBSTREAM_API_URL").unwrap_or(d.api_url),
            api_token: std::env::var("JOBSTREAM_API_TOKEN").ok().filter(|v| !v.is_empty()),
            user_agent: std::env::var("JOBSTREAM_USER_AGENT").unwrap_or(d.user_agent),
            page_size: env_parse("JOBSTREAM_PAGE_SIZE", d.page_size),
            filters: env_json_object("JOBSTREAM_FILTERS").unwrap_or(d.filters),
            extra_payload: d.extra_payload,
            max_pages: std::env::var("JOBSTREAM_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0),
            max_concurrent_requests: env_parse(
                "JOBSTREAM_MAX_CONCURRENT_REQUESTS",
                d.max_concurrent_requests,
            ),
            request_timeout_secs: env_parse("JOBSTREAM_REQUEST_TIMEOUT_SECS", d.request_timeout_secs),
            connect_timeout_secs: env_parse("JOBSTREAM_CONNECT_TIMEOUT_SECS", d.connect_timeout_secs),
            request_interval_ms: env_parse("JOBSTREAM_REQUEST_INTERVAL_MS", d.request_interval_ms),
            rate_limit_default_secs: env_parse(
                "JOBSTREAM_RATE_LIMIT_DEFAULT_SECS",
                d.rate_limit_default_secs,
            ),
            max_rate_limit_waits: env_parse("JOBSTREAM_MAX_RATE_LIMIT_WAITS", d.max_rate_limit_waits),
            fetch_retries: env_parse("JOBSTREAM_FETCH_RETRIES", d.fetch_retries),
            fetch_backoff_ms: env_parse("JOBSTREAM_FETCH_BACKOFF_MS", d.fetch_backoff_ms),
            fetch_backoff_max_ms: d.fetch_backoff_max_ms,
            batch_size: env_parse("JOBSTREAM_BATCH_SIZE", d.batch_size),
            queue_capacity: env_parse("JOBSTREAM_QUEUE_CAPACITY", d.queue_capacity),
            db_enabled: env_flag("JOBSTREAM_DB_ENABLED").unwrap_or(database_url.is_some()),
            database_url,
            db_max_connections: env_parse("JOBSTREAM_DB_MAX_CONNECTIONS", d.db_max_connections),
            db_retries: env_parse("JOBSTREAM_DB_RETRIES", d.db_retries),
            db_backoff_ms: env_parse("JOBSTREAM_DB_BACKOFF_MS", d.db_backoff_ms),
            db_backoff_max_ms: d.db_backoff_max_ms,
            circuit_breaker_threshold: env_parse(
                "JOBSTREAM_CIRCUIT_BREAKER_THRESHOLD",
                d.circuit_breaker_threshold,
            ),
            max_consumer_errors: env_parse("JOBSTREAM_MAX_CONSUMER_ERRORS", d.max_consumer_errors),
            max_failed_pages: env_parse("JOBSTREAM_MAX_FAILED_PAGES", d.max_failed_pages),
            run_timeout_secs: env_parse("JOBSTREAM_RUN_TIMEOUT_SECS", d.run_timeout_secs),
            shutdown_grace_secs: env_parse("JOBSTREAM_SHUTDOWN_GRACE_SECS", d.shutdown_grace_secs),
            resume: env_flag("JOBSTREAM_RESUME").unwrap_or(d.resume),
            lookback_pages: env_parse("JOBSTREAM_LOOKBACK_PAGES", d.lookback_pages),
            max_resume_age_secs: env_parse("JOBSTREAM_MAX_RESUME_AGE_SECS", d.max_resume_age_secs),
            data_dir: std::env::var("JOBSTREAM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            source_name: std::env::var("JOBSTREAM_SOURCE_NAME").unwrap_or(d.source_name),
            max_description_len: env_parse("JOBSTREAM_MAX_DESCRIPTION_LEN", d.max_description_len),
            upsert_chunk_size: env_parse("JOBSTREAM_UPSERT_CHUNK_SIZE", d.upsert_chunk_size),
            tag_rules_path: std::env::var("JOBSTREAM_TAG_RULES").ok().map(PathBuf::from),
            schedule_cron: std::env::var("JOBSTREAM_SCHEDULE_CRON").unwrap_or(d.schedule_cron),
            export_tabular: env_flag("JOBSTREAM_EXPORT_TABULAR").unwrap_or(d.export_tabular),
            auto_migrate: env_flag("JOBSTREAM_AUTO_MIGRATE").unwrap_or(d.auto_migrate),
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            endpoint: self.api_url.clone(),
            page_size: self.page_size,
            filters: self.filters.clone(),
            extra_payload: self.extra_payload.clone(),
            bearer_token: self.api_token.clone(),
            user_agent: Some(self.user_agent.clone()),
            timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_concurrent_requests: self.max_concurrent_requests,
            request_interval: (self.request_interval_ms > 0)
                .then(|| Duration::from_millis(self.request_interval_ms)),
            rate_limit_default_delay: Duration::from_secs(self.rate_limit_default_secs),
            max_rate_limit_waits: self.max_rate_limit_waits,
            backoff: BackoffPolicy {
                max_retries: self.fetch_retries,
                base_delay: Duration::from_millis(self.fetch_backoff_ms),
                max_delay: Duration::from_millis(self.fetch_backoff_max_ms),
            },
        }
    }

    pub fn db_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.db_retries,
            base_delay: Duration::from_millis(self.db_backoff_ms),
            max_delay: Duration::from_millis(self.db_backoff_max_ms),
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn max_resume_age(&self) -> Duration {
        Duration::from_secs(self.max_resume_age_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn database_enabled(&self) -> bool {
        self.db_enabled && self.database_url.is_some()
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable environment value");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

fn env_json_object(key: &str) -> Option<JsonValue> {
    let raw = std::env::var(key).ok()?;
    match serde_json::from_str::<JsonValue>(&raw) {
        Ok(value @ JsonValue::Object(_)) => Some(value),
        _ => {
            warn!(key, "expected a JSON object; using defaults");
            None
        }
    }
}
