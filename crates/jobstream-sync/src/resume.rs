//! Scrape progress carried from one run to the next.
//!
//! The state lives at `<data_dir>/state/scraper_state.json`. A run that ended
//! part-way resumes a few pages before where it stopped; a finished pass, a
//! stale record, or an unreadable file starts again at page 1.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobstream_storage::{BatchFileWriter, FileWriteError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const STATE_DIR: &str = "state";
pub const STATE_FILE: &str = "scraper_state.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeState {
    pub last_page_scraped: u32,
    pub last_run: DateTime<Utc>,
    /// The run reached the end of the stream or its page ceiling.
    pub complete: bool,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    #[serde(default)]
    pub jobs_persisted: usize,
}

impl ResumeState {
    pub fn start_page(&self, now: DateTime<Utc>, lookback_pages: u32, max_age: Duration) -> u32 {
        if self.complete {
            return 1;
        }
        let fresh = (now - self.last_run)
            .to_std()
            .map(|age| age <= max_age)
            .unwrap_or(false);
        if !fresh {
            return 1;
        }
        self.last_page_scraped.saturating_sub(lookback_pages).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct ResumeStore {
    writer: BatchFileWriter,
    path: PathBuf,
}

impl ResumeStore {
    pub fn new(writer: BatchFileWriter) -> Self {
        let path = writer.root().join(STATE_DIR).join(STATE_FILE);
        Self { writer, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when there is no usable saved state.
    pub async fn load(&self) -> Option<ResumeState> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no saved scrape state");
                return None;
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not read scrape state");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring unreadable scrape state");
                None
            }
        }
    }

    pub async fn save(&self, state: &ResumeState) -> Result<(), FileWriteError> {
        self.writer.write_json(&self.path, state).await?;
        info!(
            last_page = state.last_page_scraped,
            complete = state.complete,
            "scrape state saved"
        );
        Ok(())
    }
}
