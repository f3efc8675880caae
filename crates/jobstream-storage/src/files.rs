use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, SecondsFormat, Utc};
use jobstream_core::{ActivationTime, Batch, JobRecord};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

const RAW_DIR: &str = "raw";
const PROCESSED_DIR: &str = "processed";
const METADATA_DIR: &str = "batch_metadata";
const EMERGENCY_DIR: &str = "emergency";

#[derive(Debug, Error)]
pub enum FileWriteError {
    #[error("encoding json: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path has no parent directory: {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("background export task failed: {0}")]
    Join(String),
}

fn io_error(action: &'static str, path: &Path, source: std::io::Error) -> FileWriteError {
    FileWriteError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Sidecar describing the files written for one fallback batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub batch_id: Uuid,
    pub batch_date: DateTime<Utc>,
    pub seq: u64,
    pub record_count: usize,
    pub json_path: String,
    pub json_sha256: String,
    pub exports: Vec<String>,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WrittenBatch {
    pub json_path: PathBuf,
    pub sha256: String,
    pub record_count: usize,
    pub exports: Vec<PathBuf>,
    pub metadata_path: Option<PathBuf>,
}

/// Local-file persistence for batches that could not reach the database.
///
/// The JSON array is the durable copy and is always written through a temp
/// file in the target directory followed by a rename. CSV and Parquet
/// projections are best effort: failures are logged and skipped.
#[derive(Debug, Clone)]
pub struct BatchFileWriter {
    root: PathBuf,
    tabular_exports: bool,
}

impl BatchFileWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tabular_exports: true,
        }
    }

    pub fn with_tabular_exports(mut self, enabled: bool) -> Self {
        self.tabular_exports = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Creates the directory layout under the root.
    pub async fn prepare(&self) -> Result<(), FileWriteError> {
        for dir in [RAW_DIR, PROCESSED_DIR, METADATA_DIR, EMERGENCY_DIR] {
            let path = self.root.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|source| io_error("creating directory", &path, source))?;
        }
        Ok(())
    }

    pub async fn write_batch(&self, batch: &Batch) -> Result<WrittenBatch, FileWriteError> {
        let stem = batch.file_stem();
        let bytes = serde_json::to_vec_pretty(&batch.records)?;
        let json_path = self.root.join(RAW_DIR).join(format!("{stem}.json"));
        self.write_atomic(&json_path, &bytes).await?;
        let sha256 = Self::sha256_hex(&bytes);

        let exports = if self.tabular_exports {
            self.export_tabular(batch, &stem).await
        } else {
            Vec::new()
        };

        let metadata = BatchMetadata {
            batch_id: batch.batch_id,
            batch_date: batch.batch_date,
            seq: batch.seq,
            record_count: batch.len(),
            json_path: json_path.display().to_string(),
            json_sha256: sha256.clone(),
            exports: exports.iter().map(|p| p.display().to_string()).collect(),
            written_at: Utc::now(),
        };
        let metadata_path = self
            .root
            .join(METADATA_DIR)
            .join(format!("{stem}_metadata.json"));
        let metadata_path = match self.write_json(&metadata_path, &metadata).await {
            Ok(()) => Some(metadata_path),
            Err(err) => {
                warn!(batch_id = %batch.batch_id, error = %err, "could not write batch metadata");
                None
            }
        };

        info!(
            batch_id = %batch.batch_id,
            records = batch.len(),
            path = %json_path.display(),
            "batch written to local files"
        );

        Ok(WrittenBatch {
            json_path,
            sha256,
            record_count: batch.len(),
            exports,
            metadata_path,
        })
    }

    pub async fn write_json<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), FileWriteError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_atomic(path, &bytes).await
    }

    /// Writes records that could not be handed to persistence, keyed by label and timestamp.
    pub async fn emergency_dump(
        &self,
        label: &str,
        records: &[JobRecord],
    ) -> Result<PathBuf, FileWriteError> {
        let path = self.emergency_path("emergency_jobs", label);
        self.write_json(&path, records).await?;
        warn!(
            records = records.len(),
            path = %path.display(),
            "records written to emergency dump"
        );
        Ok(path)
    }

    /// Final attempt after both persistence paths failed: scalar fields only,
    /// plain synchronous write, no temp file.
    pub fn last_resort_dump(
        &self,
        label: &str,
        records: &[JobRecord],
    ) -> Result<PathBuf, FileWriteError> {
        let path = self.emergency_path("last_resort", label);
        let rows: Vec<JsonValue> = records.iter().map(scalar_projection).collect();
        let bytes = serde_json::to_vec(&rows)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| io_error("creating directory", parent, source))?;
        }
        std::fs::write(&path, bytes).map_err(|source| io_error("writing", &path, source))?;
        Ok(path)
    }

    fn emergency_path(&self, prefix: &str, label: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S_%f");
        self.root
            .join(EMERGENCY_DIR)
            .join(format!("{prefix}_{label}_{stamp}.json"))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), FileWriteError> {
        let parent = path
            .parent()
            .ok_or_else(|| FileWriteError::InvalidPath(path.to_path_buf()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|source| io_error("creating directory", parent, source))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| io_error("opening temp file", &temp_path, source))?;
        file.write_all(bytes)
            .await
            .map_err(|source| io_error("writing temp file", &temp_path, source))?;
        file.sync_all()
            .await
            .map_err(|source| io_error("syncing temp file", &temp_path, source))?;
        drop(file);

        if let Err(source) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error("renaming temp file into", path, source));
        }
        Ok(())
    }

    async fn export_tabular(&self, batch: &Batch, stem: &str) -> Vec<PathBuf> {
        let rows: Vec<FlatRow> = batch.records.iter().map(FlatRow::from_record).collect();
        let dir = self.root.join(PROCESSED_DIR);
        let stem = stem.to_string();

        let task = tokio::task::spawn_blocking(move || {
            let mut written = Vec::new();
            let record_batch = match flat_record_batch(&rows) {
                Ok(b) => b,
                Err(err) => {
                    warn!(error = %err, "could not build tabular projection");
                    return written;
                }
            };
            if let Err(err) = std::fs::create_dir_all(&dir) {
                warn!(error = %err, dir = %dir.display(), "could not create export directory");
                return written;
            }

            let parquet_path = dir.join(format!("{stem}.parquet"));
            match write_parquet(&parquet_path, &record_batch) {
                Ok(()) => written.push(parquet_path),
                Err(err) => warn!(error = %err, "parquet export skipped"),
            }
            let csv_path = dir.join(format!("{stem}.csv"));
            match write_csv(&csv_path, &record_batch) {
                Ok(()) => written.push(csv_path),
                Err(err) => warn!(error = %err, "csv export skipped"),
            }
            written
        });

        match task.await {
            Ok(paths) => paths,
            Err(err) => {
                warn!(error = %FileWriteError::Join(err.to_string()), "tabular export aborted");
                Vec::new()
            }
        }
    }
}

/// Flattened projection used for CSV/Parquet; nested values are JSON strings.
struct FlatRow {
    id: String,
    title: String,
    url: String,
    source: String,
    company_name_en: Option<String>,
    company_name_native: Option<String>,
    locations: String,
    salary: String,
    salary_min: Option<f64>,
    salary_max: Option<f64>,
    tags: String,
    activation_time: String,
    ingested_at: String,
    description: Option<String>,
}

impl FlatRow {
    fn from_record(record: &JobRecord) -> Self {
        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            url: record.url.clone(),
            source: record.source.clone(),
            company_name_en: record.company.name_en.clone(),
            company_name_native: record.company.name_native.clone(),
            locations: serde_json::to_string(&record.locations).unwrap_or_else(|_| "[]".into()),
            salary: serde_json::to_string(&record.salary).unwrap_or_default(),
            salary_min: record.salary_min.or_else(|| record.salary.min()),
            salary_max: record.salary_max.or_else(|| record.salary.max()),
            tags: record.tags.join(","),
            activation_time: match &record.activation_time {
                ActivationTime::Parsed(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
                ActivationTime::Unparsed(raw) => raw.clone(),
            },
            ingested_at: record.ingested_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            description: record.description.clone(),
        }
    }
}

fn flat_record_batch(rows: &[FlatRow]) -> anyhow::Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("url", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("company_name_en", DataType::Utf8, true),
        ArrowField::new("company_name_native", DataType::Utf8, true),
        ArrowField::new("locations", DataType::Utf8, false),
        ArrowField::new("salary", DataType::Utf8, false),
        ArrowField::new("salary_min", DataType::Float64, true),
        ArrowField::new("salary_max", DataType::Float64, true),
        ArrowField::new("tags", DataType::Utf8, false),
        ArrowField::new("activation_time", DataType::Utf8, false),
        ArrowField::new("ingested_at", DataType::Utf8, false),
        ArrowField::new("description", DataType::Utf8, true),
    ]));

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(utf8_column(rows, |r| Some(r.id.as_str()))),
            Arc::new(utf8_column(rows, |r| Some(r.title.as_str()))),
            Arc::new(utf8_column(rows, |r| Some(r.url.as_str()))),
            Arc::new(utf8_column(rows, |r| Some(r.source.as_str()))),
            Arc::new(utf8_column(rows, |r| r.company_name_en.as_deref())),
            Arc::new(utf8_column(rows, |r| r.company_name_native.as_deref())),
            Arc::new(utf8_column(rows, |r| Some(r.locations.as_str()))),
            Arc::new(utf8_column(rows, |r| Some(r.salary.as_str()))),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.salary_min).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.salary_max).collect::<Vec<_>>(),
            )),
            Arc::new(utf8_column(rows, |r| Some(r.tags.as_str()))),
            Arc::new(utf8_column(rows, |r| Some(r.activation_time.as_str()))),
            Arc::new(utf8_column(rows, |r| Some(r.ingested_at.as_str()))),
            Arc::new(utf8_column(rows, |r| r.description.as_deref())),
        ],
    )
    .context("building flattened record batch")
}

fn utf8_column<'a>(
    rows: &'a [FlatRow],
    value: impl Fn(&'a FlatRow) -> Option<&'a str>,
) -> StringArray {
    StringArray::from(rows.iter().map(value).collect::<Vec<_>>())
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_csv(path: &Path, batch: &RecordBatch) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = arrow_csv::Writer::new(file);
    writer
        .write(batch)
        .with_context(|| format!("writing csv {}", path.display()))?;
    Ok(())
}

/// Keeps the identifying fields plus every scalar value of the upstream object.
fn scalar_projection(record: &JobRecord) -> JsonValue {
    let mut out = Map::new();
    out.insert("id".into(), JsonValue::String(record.id.clone()));
    out.insert("title".into(), JsonValue::String(record.title.clone()));
    out.insert("url".into(), JsonValue::String(record.url.clone()));
    if let JsonValue::Object(raw) = &record.raw {
        for (key, value) in raw {
            if !(value.is_object() || value.is_array()) && !out.contains_key(key) {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    JsonValue::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobstream_core::{Company, Salary};
    use serde_json::json;
    use tempfile::tempdir;

    fn mk_record(id: &str) -> JobRecord {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap();
        JobRecord {
            id: id.to_string(),
            title: format!("Backend engineer {id}"),
            url: format!("https://jobs.example.com/{id}"),
            source: "api_scraper".into(),
            description: Some("Rust services".into()),
            company: Company {
                name_en: Some("Acme".into()),
                ..Company::default()
            },
            locations: vec![json!({"province": {"id": 8}, "city": {"id": 1}})],
            salary: Salary::Range {
                min: Some(10.0),
                max: Some(20.0),
                currency: Some("IRR".into()),
                text: None,
            },
            salary_min: None,
            salary_max: None,
            tags: vec!["remote".into()],
            tag_codes: vec![0],
            work_types: json!([]),
            categories: json!([]),
            item_index: Some(1),
            activation_time: ActivationTime::Parsed(at),
            ingested_at: at,
            raw: json!({"id": id, "title": "raw title", "nested": {"x": 1}, "itemIndex": 1}),
        }
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            BatchFileWriter::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn batch_write_produces_json_exports_and_metadata() {
        let dir = tempdir().unwrap();
        let writer = BatchFileWriter::new(dir.path());
        writer.prepare().await.unwrap();
        let batch = Batch::new(3, vec![mk_record("a"), mk_record("b")]);

        let written = writer.write_batch(&batch).await.unwrap();

        let bytes = std::fs::read(&written.json_path).unwrap();
        let parsed: Vec<JobRecord> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, batch.records);
        assert_eq!(written.sha256, BatchFileWriter::sha256_hex(&bytes));
        assert_eq!(written.exports.len(), 2);
        assert!(written.exports.iter().all(|p| p.exists()));
        let metadata_path = written.metadata_path.unwrap();
        let metadata: BatchMetadata =
            serde_json::from_slice(&std::fs::read(metadata_path).unwrap()).unwrap();
        assert_eq!(metadata.record_count, 2);
        assert_eq!(metadata.batch_id, batch.batch_id);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join(RAW_DIR))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn exports_can_be_disabled() {
        let dir = tempdir().unwrap();
        let writer = BatchFileWriter::new(dir.path()).with_tabular_exports(false);
        let written = writer
            .write_batch(&Batch::new(1, vec![mk_record("a")]))
            .await
            .unwrap();
        assert!(written.exports.is_empty());
        assert!(written.json_path.exists());
    }

    #[tokio::test]
    async fn unwritable_root_fails_the_json_write() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let writer = BatchFileWriter::new(&blocker);

        let err = writer
            .write_batch(&Batch::new(1, vec![mk_record("a")]))
            .await
            .unwrap_err();
        assert!(matches!(err, FileWriteError::Io { .. }));
        assert!(writer.last_resort_dump("lost", &[mk_record("a")]).is_err());
    }

    #[tokio::test]
    async fn emergency_and_last_resort_dumps_keep_identity() {
        let dir = tempdir().unwrap();
        let writer = BatchFileWriter::new(dir.path());
        let records = vec![mk_record("a"), mk_record("b")];

        let path = writer.emergency_dump("unqueued", &records).await.unwrap();
        let dumped: Vec<JobRecord> = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(dumped.len(), 2);

        let path = writer.last_resort_dump("batch", &records).unwrap();
        let rows: Vec<JsonValue> = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(rows[0]["id"], json!("a"));
        assert_eq!(rows[0]["title"], json!("Backend engineer a"));
        assert_eq!(rows[0]["itemIndex"], json!(1));
        assert!(rows[0].get("nested").is_none());
    }
}
