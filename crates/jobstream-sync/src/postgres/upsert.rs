//! Staging-and-merge upsert of one batch into `jobs`.
//!
//! ```text
//! BEGIN
//!   TRUNCATE jobs_staging
//!   INSERT INTO jobs_staging ... (chunked multi-row VALUES)
//!   INSERT INTO jobs SELECT DISTINCT ON (id) ... FROM jobs_staging
//!     ON CONFLICT (id) DO UPDATE SET <mutable columns>, updated_at = NOW()
//! COMMIT
//! ```
//!
//! `created_at` is only ever set by the insert arm, so re-running a batch
//! refreshes `updated_at` and leaves the first-seen timestamp alone.

use std::time::Instant;

use jobstream_core::{Batch, BatchStatus};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};

use super::rows::{JobRow, JOB_COLUMNS};
use crate::store::StoreError;

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone)]
pub struct BatchUpsertEngine {
    chunk_size: usize,
    source: String,
}

impl BatchUpsertEngine {
    pub fn new(chunk_size: usize, source: impl Into<String>) -> Self {
        let max_rows = MAX_BIND_PARAMS / JOB_COLUMNS.len();
        Self {
            chunk_size: chunk_size.clamp(1, max_rows),
            source: source.into(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns the number of rows inserted or updated. Lifecycle rows in
    /// `job_batches` are best-effort and never fail the upsert.
    pub async fn upsert(&self, pool: &PgPool, batch: &Batch) -> Result<u64, StoreError> {
        let started = Instant::now();
        self.record_start(pool, batch).await;

        match self.merge(pool, batch).await {
            Ok(affected) => {
                let elapsed_ms = started.elapsed().as_millis() as i64;
                self.record_finish(pool, batch, BatchStatus::Completed, Some(affected), elapsed_ms, None)
                    .await;
                debug!(batch_id = %batch.batch_id, affected, elapsed_ms, "merge committed");
                Ok(affected)
            }
            Err(err) => {
                let elapsed_ms = started.elapsed().as_millis() as i64;
                let message = err.to_string();
                self.record_finish(pool, batch, BatchStatus::Failed, None, elapsed_ms, Some(&message))
                    .await;
                Err(err)
            }
        }
    }

    async fn merge(&self, pool: &PgPool, batch: &Batch) -> Result<u64, StoreError> {
        let rows: Vec<JobRow> = batch
            .records
            .iter()
            .map(|record| JobRow::from_record(record, batch))
            .collect();

        let mut tx = pool.begin().await?;
        sqlx::query("TRUNCATE jobs_staging").execute(&mut *tx).await?;

        for chunk in rows.chunks(self.chunk_size) {
            let mut insert = staging_insert(chunk);
            insert.build().execute(&mut *tx).await?;
        }

        let result = sqlx::query(&merge_sql()).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn record_start(&self, pool: &PgPool, batch: &Batch) {
        let result = sqlx::query(
            r#"
            INSERT INTO job_batches (batch_id, batch_date, seq, record_count, source, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (batch_id) DO UPDATE SET
                status = EXCLUDED.status,
                error_message = NULL,
                completed_at = NULL
            "#,
        )
        .bind(batch.batch_id)
        .bind(batch.batch_date)
        .bind(batch.seq as i64)
        .bind(batch.len() as i32)
        .bind(&self.source)
        .bind(BatchStatus::Processing.as_str())
        .execute(pool)
        .await;
        if let Err(err) = result {
            warn!(batch_id = %batch.batch_id, error = %err, "could not record batch start");
        }
    }

    async fn record_finish(
        &self,
        pool: &PgPool,
        batch: &Batch,
        status: BatchStatus,
        affected: Option<u64>,
        elapsed_ms: i64,
        error_message: Option<&str>,
    ) {
        let result = sqlx::query(
            r#"
            UPDATE job_batches
               SET status = $2,
                   affected_rows = $3,
                   elapsed_ms = $4,
                   error_message = $5,
                   completed_at = NOW()
             WHERE batch_id = $1
            "#,
        )
        .bind(batch.batch_id)
        .bind(status.as_str())
        .bind(affected.map(|n| n as i64))
        .bind(elapsed_ms)
        .bind(error_message)
        .execute(pool)
        .await;
        if let Err(err) = result {
            warn!(batch_id = %batch.batch_id, status = status.as_str(), error = %err, "could not record batch outcome");
        }
    }
}

fn staging_insert(chunk: &[JobRow]) -> QueryBuilder<'static, Postgres> {
    let mut insert = QueryBuilder::new("INSERT INTO jobs_staging (");
    insert.push(JOB_COLUMNS.join(", "));
    insert.push(") ");
    insert.push_values(chunk, |mut b, row| {
        b.push_bind(row.id.clone())
            .push_bind(row.title.clone())
            .push_bind(row.url.clone())
            .push_bind(row.source.clone())
            .push_bind(row.description.clone())
            .push_bind(row.company_id.clone())
            .push_bind(row.company_name_en.clone())
            .push_bind(row.company_name_native.clone())
            .push_bind(row.company_about.clone())
            .push_bind(row.company_url.clone())
            .push_bind(row.locations.clone())
            .push_bind(row.location_ids.clone())
            .push_bind(row.salary.clone())
            .push_bind(row.salary_min)
            .push_bind(row.salary_max)
            .push_bind(row.tags.clone())
            .push_bind(row.tag_codes.clone())
            .push_bind(row.work_types.clone())
            .push_bind(row.categories.clone())
            .push_bind(row.item_index)
            .push_bind(row.activation_time)
            .push_bind(row.raw_data.clone())
            .push_bind(row.batch_id)
            .push_bind(row.batch_date);
    });
    insert
}

pub(crate) fn merge_sql() -> String {
    let columns = JOB_COLUMNS.join(", ");
    let updates = JOB_COLUMNS
        .iter()
        .filter(|c| **c != "id")
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(",\n    ");
    format!(
        "INSERT INTO jobs ({columns}, created_at, updated_at)\n\
         SELECT DISTINCT ON (id) {columns}, NOW(), NOW()\n\
         FROM jobs_staging\n\
         ORDER BY id\n\
         ON CONFLICT (id) DO UPDATE SET\n    {updates},\n    updated_at = NOW()"
    )
}
