//! Core domain model for the job listing ingestion pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobstream-core";

/// Company identifiers carried by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Company {
    pub id: Option<String>,
    pub name_en: Option<String>,
    pub name_native: Option<String>,
    pub about: Option<String>,
    pub url: Option<String>,
}

/// Canonical salary shape: either a structured range or an opaque string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Salary {
    Range {
        min: Option<f64>,
        max: Option<f64>,
        currency: Option<String>,
        text: Option<String>,
    },
    Text { value: String },
}

impl Salary {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text {
            value: value.into(),
        }
    }

    pub fn min(&self) -> Option<f64> {
        match self {
            Self::Range { min, .. } => *min,
            Self::Text { .. } => None,
        }
    }

    pub fn max(&self) -> Option<f64> {
        match self {
            Self::Range { max, .. } => *max,
            Self::Text { .. } => None,
        }
    }
}

impl Default for Salary {
    fn default() -> Self {
        Self::text("")
    }
}

/// Activation/posted timestamp. Values no known format could parse are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ActivationTime {
    Parsed(DateTime<Utc>),
    Unparsed(String),
}

impl ActivationTime {
    /// Resolves to a concrete timestamp, substituting `fallback` for unparsed values.
    pub fn resolve(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Parsed(ts) => *ts,
            Self::Unparsed(_) => fallback,
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }
}

/// One normalized listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub title: String,
    pub url: String,
    pub source: String,
    pub description: Option<String>,
    pub company: Company,
    pub locations: Vec<JsonValue>,
    pub salary: Salary,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub tags: Vec<String>,
    pub tag_codes: Vec<u32>,
    pub work_types: JsonValue,
    pub categories: JsonValue,
    pub item_index: Option<i64>,
    pub activation_time: ActivationTime,
    pub ingested_at: DateTime<Utc>,
    /// Upstream object as received.
    pub raw: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A bounded group of records persisted as one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub batch_date: DateTime<Utc>,
    pub seq: u64,
    pub records: Vec<JobRecord>,
}

impl Batch {
    pub fn new(seq: u64, records: Vec<JobRecord>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            batch_date: Utc::now(),
            seq,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// File-friendly name, e.g. `batch_0007_20260301_120000`.
    pub fn file_stem(&self) -> String {
        format!(
            "batch_{:04}_{}",
            self.seq,
            self.batch_date.format("%Y%m%d_%H%M%S")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Failed | Self::Stopped
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Initialization,
    Scraping,
    Cleanup,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::Scraping => "scraping",
            Self::Cleanup => "cleanup",
        }
    }
}

/// Record-level validation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ValidationCounts {
    pub validated: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

impl ValidationCounts {
    pub fn absorb(&mut self, other: ValidationCounts) {
        self.validated += other.validated;
        self.duplicates += other.duplicates;
        self.invalid += other.invalid;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunErrorEntry {
    pub phase: RunPhase,
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl RunErrorEntry {
    pub fn new(phase: RunPhase, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            phase,
            kind: kind.into(),
            message: message.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
}

/// Live view of a run. Only the orchestrator mutates it; readers get copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunState {
    pub run_id: Option<Uuid>,
    pub status: RunStatus,
    pub phase: Option<RunPhase>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// First page requested; above 1 when resuming an earlier run.
    pub start_page: u32,
    pub pages_processed: u32,
    pub failed_pages: Vec<u32>,
    pub jobs_found: usize,
    pub validation: ValidationCounts,
    pub jobs_persisted: usize,
    pub jobs_lost: usize,
    /// Records that never reached a batch write but landed in an emergency dump.
    pub jobs_dumped: usize,
    pub batches_persisted: usize,
    pub batches_to_file: usize,
    pub batches_lost: usize,
    pub circuit_open: bool,
    pub errors: Vec<RunErrorEntry>,
}

/// Final statistics emitted on every terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub start_page: u32,
    pub pages_processed: u32,
    pub failed_pages: Vec<u32>,
    pub jobs_found: usize,
    pub validated: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub jobs_persisted: usize,
    pub jobs_lost: usize,
    pub jobs_dumped: usize,
    pub batches_persisted: usize,
    pub batches_to_file: usize,
    pub batches_lost: usize,
    pub circuit_opened: bool,
    pub jobs_per_page: f64,
    pub jobs_per_second: f64,
    pub phases: Vec<PhaseTiming>,
    pub errors: Vec<RunErrorEntry>,
}

impl RunSummary {
    /// Freezes a terminal `RunState` into a summary.
    pub fn from_state(
        state: &RunState,
        reason: Option<String>,
        phases: Vec<PhaseTiming>,
    ) -> Self {
        let started_at = state.start_time.unwrap_or_else(Utc::now);
        let finished_at = state.end_time.unwrap_or_else(Utc::now);
        let elapsed_secs = (finished_at - started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let jobs_per_page = if state.pages_processed > 0 {
            state.jobs_found as f64 / f64::from(state.pages_processed)
        } else {
            0.0
        };
        let jobs_per_second = if elapsed_secs > 0.0 {
            state.jobs_persisted as f64 / elapsed_secs
        } else {
            0.0
        };

        Self {
            run_id: state.run_id.unwrap_or_else(Uuid::nil),
            status: state.status,
            reason,
            started_at,
            finished_at,
            elapsed_secs,
            start_page: state.start_page,
            pages_processed: state.pages_processed,
            failed_pages: state.failed_pages.clone(),
            jobs_found: state.jobs_found,
            validated: state.validation.validated,
            duplicates: state.validation.duplicates,
            invalid: state.validation.invalid,
            jobs_persisted: state.jobs_persisted,
            jobs_lost: state.jobs_lost,
            jobs_dumped: state.jobs_dumped,
            batches_persisted: state.batches_persisted,
            batches_to_file: state.batches_to_file,
            batches_lost: state.batches_lost,
            circuit_opened: state.circuit_open,
            jobs_per_page,
            jobs_per_second,
            phases,
            errors: state.errors.clone(),
        }
    }
}
