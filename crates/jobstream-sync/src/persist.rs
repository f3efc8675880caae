use std::path::PathBuf;
use std::sync::Arc;

use jobstream_core::Batch;
use jobstream_storage::{BatchFileWriter, RetryDisposition, RetryPolicy};
use tracing::{debug, error, info, warn};

use crate::circuit::CircuitBreaker;
use crate::store::{JobStore, StoreError};

#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Database { affected: u64 },
    File { path: PathBuf },
    Lost { reason: String },
}

impl PersistOutcome {
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Lost { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }
}

/// Chooses, per batch, between the database upsert and the file fallback.
///
/// Owns the run's [`CircuitBreaker`]. Once the breaker opens, no further
/// upsert is attempted through this coordinator.
pub struct PersistenceCoordinator {
    store: Option<Arc<dyn JobStore>>,
    writer: BatchFileWriter,
    retry: RetryPolicy,
    circuit: CircuitBreaker,
}

impl PersistenceCoordinator {
    pub fn new(
        store: Option<Arc<dyn JobStore>>,
        writer: BatchFileWriter,
        retry: RetryPolicy,
        circuit_threshold: u32,
    ) -> Self {
        Self {
            store,
            writer,
            retry,
            circuit: CircuitBreaker::new(circuit_threshold),
        }
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn database_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn writer(&self) -> &BatchFileWriter {
        &self.writer
    }

    pub async fn persist(&mut self, batch: &Batch) -> PersistOutcome {
        let db_error = match self.store.clone() {
            Some(_) if self.circuit.is_open() => {
                debug!(batch_id = %batch.batch_id, "circuit open; skipping database");
                None
            }
            Some(store) => match self.upsert_with_retry(store, batch).await {
                Ok(affected) => {
                    info!(
                        batch_id = %batch.batch_id,
                        records = batch.len(),
                        affected,
                        "batch upserted"
                    );
                    return PersistOutcome::Database { affected };
                }
                Err(err) => {
                    warn!(
                        batch_id = %batch.batch_id,
                        error = %err,
                        "database path failed; falling back to files"
                    );
                    Some(err)
                }
            },
            None => None,
        };

        self.write_fallback(batch, db_error).await
    }

    async fn upsert_with_retry(
        &mut self,
        store: Arc<dyn JobStore>,
        batch: &Batch,
    ) -> Result<u64, StoreError> {
        let retry = self.retry;
        let circuit = &mut self.circuit;

        let result = retry
            .run(
                "batch_upsert",
                |_| {
                    let store = store.clone();
                    async move {
                        if !store.is_connected() && !store.ensure_connection().await {
                            return Err(StoreError::Connection("reconnect failed".into()));
                        }
                        store.insert_batch(batch).await
                    }
                },
                |err: &StoreError, attempt| {
                    warn!(
                        batch_id = %batch.batch_id,
                        attempt = attempt + 1,
                        kind = err.kind(),
                        error = %err,
                        "upsert attempt failed"
                    );
                    if err.is_connection() && (circuit.record_connection_failure() || circuit.is_open()) {
                        return RetryDisposition::NonRetryable;
                    }
                    RetryDisposition::Retryable
                },
            )
            .await;

        if result.is_ok() {
            self.circuit.record_success();
        }
        result
    }

    async fn write_fallback(&self, batch: &Batch, db_error: Option<StoreError>) -> PersistOutcome {
        match self.writer.write_batch(batch).await {
            Ok(written) => PersistOutcome::File {
                path: written.json_path,
            },
            Err(file_err) => {
                let db_reason = db_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "database path skipped".to_string());
                error!(
                    critical = true,
                    batch_id = %batch.batch_id,
                    records = batch.len(),
                    db_error = %db_reason,
                    file_error = %file_err,
                    "batch could not be persisted to database or files"
                );

                let label = batch.batch_id.simple().to_string();
                match self.writer.last_resort_dump(&label, &batch.records) {
                    Ok(path) => warn!(path = %path.display(), "last-resort dump written"),
                    Err(err) => error!(critical = true, error = %err, "last-resort dump failed"),
                }

                PersistOutcome::Lost {
                    reason: format!("{db_reason}; file fallback: {file_err}"),
                }
            }
        }
    }
}
