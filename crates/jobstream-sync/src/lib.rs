//! Streaming ingestion runtime: producer/consumer pipeline, persistence with
//! circuit breaker and file fallback, Postgres upserts and the run
//! orchestrator.

pub mod circuit;
pub mod config;
pub mod orchestrator;
pub mod persist;
pub mod pipeline;
pub mod postgres;
pub mod queue;
pub mod resume;
pub mod schedule;
pub mod store;

pub use circuit::{CircuitBreaker, CircuitState};
pub use config::SyncConfig;
pub use orchestrator::{RunError, RunOrchestrator};
pub use persist::{PersistOutcome, PersistenceCoordinator};
pub use pipeline::{BatchAccumulator, ProgressEvent};
pub use postgres::{BatchUpsertEngine, PgJobStore, PgStoreConfig, MIGRATOR};
pub use queue::{ingestion_queue, QueueItem, QueueReceiver, QueueSender};
pub use resume::{ResumeState, ResumeStore};
pub use schedule::build_scheduler;
pub use store::{JobStore, JsonFileStatsSink, StatsSink, StoreError, TracingStatsSink};

pub const CRATE_NAME: &str = "jobstream-sync";

