//! Postgres-backed [`JobStore`] and stats sink.

mod rows;
mod upsert;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use jobstream_core::{Batch, RunSummary};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};

pub use rows::{JobRow, JOB_COLUMNS};
pub use upsert::BatchUpsertEngine;

use crate::config::SyncConfig;
use crate::store::{JobStore, StatsSink, StoreError};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub auto_migrate: bool,
    pub chunk_size: usize,
    pub source: String,
}

impl PgStoreConfig {
    /// `None` when the database path is disabled or no URL is configured.
    pub fn from_sync_config(config: &SyncConfig) -> Option<Self> {
        if !config.database_enabled() {
            return None;
        }
        Some(Self {
            database_url: config.database_url.clone()?,
            max_connections: config.db_max_connections.max(1),
            acquire_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
            auto_migrate: config.auto_migrate,
            chunk_size: config.upsert_chunk_size,
            source: config.source_name.clone(),
        })
    }
}

/// Lazily connected pool plus the upsert engine.
///
/// The pool is dropped on `close` and rebuilt by the next
/// `ensure_connection`.
pub struct PgJobStore {
    config: PgStoreConfig,
    pool: Mutex<Option<PgPool>>,
    connected: AtomicBool,
    engine: BatchUpsertEngine,
}

impl PgJobStore {
    pub fn new(config: PgStoreConfig) -> Self {
        let engine = BatchUpsertEngine::new(config.chunk_size, config.source.clone());
        Self {
            config,
            pool: Mutex::new(None),
            connected: AtomicBool::new(false),
            engine,
        }
    }

    pub async fn connect(config: PgStoreConfig) -> Result<Self, StoreError> {
        let store = Self::new(config);
        store.open().await?;
        Ok(store)
    }

    pub fn engine(&self) -> &BatchUpsertEngine {
        &self.engine
    }

    /// Applies pending migrations, connecting first if needed.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let pool = match self.current_pool() {
            Some(pool) => pool,
            None => self.open_pool().await?,
        };
        run_migrations(&pool).await
    }

    fn current_pool(&self) -> Option<PgPool> {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_pool(&self, pool: Option<PgPool>) -> Option<PgPool> {
        let mut slot = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, pool)
    }

    async fn open_pool(&self) -> Result<PgPool, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.acquire_timeout)
            .connect(&self.config.database_url)
            .await?;
        self.set_pool(Some(pool.clone()));
        Ok(pool)
    }

    async fn open(&self) -> Result<PgPool, StoreError> {
        let pool = self.open_pool().await?;
        if self.config.auto_migrate {
            run_migrations(&pool).await?;
        }
        self.connected.store(true, Ordering::SeqCst);
        info!(
            max_connections = self.config.max_connections,
            chunk_size = self.engine.chunk_size(),
            "database pool ready"
        );
        Ok(pool)
    }

    async fn ping(pool: &PgPool) -> bool {
        sqlx::query("SELECT 1").execute(pool).await.is_ok()
    }
}

async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|err| StoreError::Query(format!("applying migrations: {err}")))?;
    info!("database migrations applied");
    Ok(())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn ensure_connection(&self) -> bool {
        if let Some(pool) = self.current_pool() {
            if Self::ping(&pool).await {
                self.connected.store(true, Ordering::SeqCst);
                return true;
            }
            warn!("database ping failed; reconnecting");
            self.connected.store(false, Ordering::SeqCst);
            if let Some(stale) = self.set_pool(None) {
                stale.close().await;
            }
        }

        match self.open().await {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "database connection attempt failed");
                self.connected.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn insert_batch(&self, batch: &Batch) -> Result<u64, StoreError> {
        let Some(pool) = self.current_pool() else {
            self.connected.store(false, Ordering::SeqCst);
            return Err(StoreError::Connection("no open pool".into()));
        };
        let result = self.engine.upsert(&pool, batch).await;
        if let Err(err) = &result {
            if err.is_connection() {
                self.connected.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(pool) = self.set_pool(None) {
            pool.close().await;
            info!("database pool closed");
        }
    }
}

#[async_trait]
impl StatsSink for PgJobStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn record_run(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let Some(pool) = self.current_pool() else {
            anyhow::bail!("database not connected");
        };
        sqlx::query(
            r#"
            INSERT INTO scraper_stats (
                run_id, run_date, status, reason, pages_processed, jobs_found,
                jobs_persisted, jobs_lost, errors, elapsed_secs, summary
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(summary.run_id)
        .bind(summary.started_at)
        .bind(summary.status.as_str())
        .bind(summary.reason.as_deref())
        .bind(summary.pages_processed as i32)
        .bind(summary.jobs_found as i64)
        .bind(summary.jobs_persisted as i64)
        .bind(summary.jobs_lost as i64)
        .bind(summary.errors.len() as i32)
        .bind(summary.elapsed_secs)
        .bind(serde_json::to_value(summary)?)
        .execute(&pool)
        .await?;
        Ok(())
    }
}
