use std::path::PathBuf;

use async_trait::async_trait;
use jobstream_core::{Batch, RunSummary};
use jobstream_storage::BatchFileWriter;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection error: {0}")]
    Connection(String),
    #[error("database query error: {0}")]
    Query(String),
    #[error("row serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Connection-class failures feed the circuit breaker; the rest do not.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Query(_) => "query",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(err.to_string()),
            sqlx::Error::Encode(_) => Self::Serialization(err.to_string()),
            _ => Self::Query(err.to_string()),
        }
    }
}

/// Database collaborator used by the persistence path.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Connects (or reconnects) and reports whether the store is usable.
    async fn ensure_connection(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Upserts every record of the batch; returns the affected row count.
    async fn insert_batch(&self, batch: &Batch) -> Result<u64, StoreError>;

    /// Releases held connections. A later `ensure_connection` may reconnect.
    async fn close(&self);
}

/// Receives the final summary of every run.
#[async_trait]
pub trait StatsSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn record_run(&self, summary: &RunSummary) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct TracingStatsSink;

#[async_trait]
impl StatsSink for TracingStatsSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn record_run(&self, summary: &RunSummary) -> anyhow::Result<()> {
        info!(
            run_id = %summary.run_id,
            status = %summary.status,
            reason = summary.reason.as_deref().unwrap_or(""),
            pages = summary.pages_processed,
            failed_pages = ?summary.failed_pages,
            found = summary.jobs_found,
            validated = summary.validated,
            duplicates = summary.duplicates,
            invalid = summary.invalid,
            persisted = summary.jobs_persisted,
            lost = summary.jobs_lost,
            elapsed_secs = summary.elapsed_secs,
            jobs_per_second = summary.jobs_per_second,
            "run finished"
        );
        Ok(())
    }
}

/// Writes each summary to `<root>/monitor/scrape_monitor_<timestamp>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStatsSink {
    writer: BatchFileWriter,
}

impl JsonFileStatsSink {
    pub fn new(writer: BatchFileWriter) -> Self {
        Self { writer }
    }

    pub fn path_for(&self, summary: &RunSummary) -> PathBuf {
        self.writer.root().join("monitor").join(format!(
            "scrape_monitor_{}_{}.json",
            summary.finished_at.format("%Y%m%d_%H%M%S"),
            summary.run_id.simple()
        ))
    }
}

#[async_trait]
impl StatsSink for JsonFileStatsSink {
    fn name(&self) -> &'static str {
        "json_file"
    }

    async fn record_run(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let path = self.path_for(summary);
        self.writer.write_json(&path, summary).await?;
        info!(path = %path.display(), "run summary written");
        Ok(())
    }
}
