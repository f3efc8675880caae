#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use jobstream_core::Batch;
use jobstream_sync::{JobStore, StoreError, SyncConfig};
use serde_json::{json, Value as JsonValue};

/// Fake listings API: page N serves `per_page` listings, `hasNextPage` turns
/// false on `last_page`. `status` replaces the body from `status_from_page` on.
pub struct Upstream {
    pub last_page: u32,
    pub per_page: usize,
    pub status: Option<StatusCode>,
    pub status_from_page: u32,
    pub delay: Duration,
    pub hits: AtomicUsize,
    pub pages: Mutex<Vec<u32>>,
}

impl Upstream {
    pub fn new(last_page: u32, per_page: usize) -> Self {
        Self {
            last_page,
            per_page,
            status: None,
            status_from_page: 1,
            delay: Duration::ZERO,
            hits: AtomicUsize::new(0),
            pages: Mutex::new(Vec::new()),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_status_from_page(mut self, page: u32, status: StatusCode) -> Self {
        self.status = Some(status);
        self.status_from_page = page;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn listings(State(upstream): State<Arc<Upstream>>, Json(body): Json<JsonValue>) -> Response {
    upstream.hits.fetch_add(1, Ordering::SeqCst);
    let page = body.get("page").and_then(JsonValue::as_u64).unwrap_or(0) as u32;
    upstream.pages.lock().unwrap().push(page);
    if !upstream.delay.is_zero() {
        tokio::time::sleep(upstream.delay).await;
    }
    if let Some(status) = upstream.status.filter(|_| page >= upstream.status_from_page) {
        return (status, Json(json!({"error": "rejected"}))).into_response();
    }

    let posts: Vec<JsonValue> = (0..upstream.per_page)
        .map(|i| {
            json!({
                "id": format!("p{page}-{i}"),
                "title": format!("Engineer {page}.{i}"),
                "url": format!("jobs.example.com/p{page}/{i}"),
                "activationTime": "2026-03-01 10:00:00",
                "locations": [{"province": {"id": 8}, "city": {"id": 1}}],
                "tags": ["remote"]
            })
        })
        .collect();
    Json(json!({
        "data": {
            "jobPosts": posts,
            "hasNextPage": page < upstream.last_page
        }
    }))
    .into_response()
}

pub async fn spawn_upstream(upstream: Upstream) -> (String, Arc<Upstream>) {
    let upstream = Arc::new(upstream);
    let app = Router::new()
        .route("/api/jobs", post(listings))
        .with_state(upstream.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/api/jobs"), upstream)
}

pub fn test_config(api_url: String, data_dir: &Path) -> SyncConfig {
    SyncConfig {
        api_url,
        data_dir: data_dir.to_path_buf(),
        request_timeout_secs: 10,
        connect_timeout_secs: 2,
        fetch_retries: 0,
        fetch_backoff_ms: 1,
        db_retries: 0,
        db_backoff_ms: 1,
        export_tabular: false,
        shutdown_grace_secs: 1,
        ..SyncConfig::default()
    }
}

pub struct MockStore {
    pub connected: AtomicBool,
    pub reconnect_ok: AtomicBool,
    pub fail_with_connection: AtomicBool,
    pub insert_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub ids: Mutex<Vec<String>>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self {
            connected: AtomicBool::new(true),
            reconnect_ok: AtomicBool::new(true),
            fail_with_connection: AtomicBool::new(false),
            insert_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            ids: Mutex::new(Vec::new()),
        }
    }
}

impl MockStore {
    pub fn unreachable() -> Self {
        let store = Self::default();
        store.connected.store(false, Ordering::SeqCst);
        store.reconnect_ok.store(false, Ordering::SeqCst);
        store
    }

    pub fn dropping_connections() -> Self {
        let store = Self::default();
        store.fail_with_connection.store(true, Ordering::SeqCst);
        store
    }

    pub fn calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for MockStore {
    async fn ensure_connection(&self) -> bool {
        let ok = self.reconnect_ok.load(Ordering::SeqCst);
        self.connected.store(ok, Ordering::SeqCst);
        ok
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn insert_batch(&self, batch: &Batch) -> Result<u64, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_with_connection.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection reset by peer".into()));
        }
        self.ids
            .lock()
            .unwrap()
            .extend(batch.records.iter().map(|r| r.id.clone()));
        Ok(batch.len() as u64)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                .count()
        })
        .unwrap_or(0)
}

/// Ids of every record written under `<data_dir>/emergency`.
pub fn emergency_ids(data_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(data_dir.join("emergency")) else {
        return Vec::new();
    };
    let mut ids = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            let records: Vec<JsonValue> =
                serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
            ids.extend(
                records
                    .iter()
                    .filter_map(|r| r.get("id").and_then(JsonValue::as_str))
                    .map(str::to_string),
            );
        }
    }
    ids.sort();
    ids
}
