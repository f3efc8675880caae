//! Validation, de-duplication and normalization of raw upstream listings.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use jobstream_core::{ActivationTime, Company, JobRecord, Salary, ValidationCounts};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "jobstream-records";

pub const IDENTITY_FIELD: &str = "id";
pub const TITLE_FIELD: &str = "title";
/// Accepted names for the activation/posted timestamp, highest priority first.
pub const ACTIVATION_FIELDS: [&str; 3] = ["activationTime", "posted_date", "postedDate"];
pub const DEFAULT_SOURCE_NAME: &str = "api_scraper";
pub const DEFAULT_MAX_DESCRIPTION_LEN: usize = 65_535;

const NAIVE_DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
];
const DATE_ONLY_FORMAT: &str = "%Y-%m-%d";
const SALARY_KEYS: [&str; 3] = ["min", "max", "text"];

#[derive(Debug, Error)]
pub enum TagTableError {
    #[error("reading tag table {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing tag table {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Deserialize)]
struct TagTableFile {
    codes: Vec<TagCodeEntry>,
}

#[derive(Debug, Deserialize)]
struct TagCodeEntry {
    label: String,
    code: u32,
}

/// Maps free-text tag labels onto a fixed numeric code set. Unknown labels map to 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagCodeTable {
    codes: HashMap<String, u32>,
}

impl Default for TagCodeTable {
    fn default() -> Self {
        let codes = [
            ("پاره وقت", 1),
            ("part-time", 1),
            ("بدون نیاز به سابقه", 2),
            ("no experience required", 2),
            ("پروژه ای", 3),
            ("project-based", 3),
            ("کارآموزی", 4),
            ("internship", 4),
        ]
        .into_iter()
        .map(|(label, code)| (label.to_string(), code))
        .collect();
        Self { codes }
    }
}

impl TagCodeTable {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        let file: TagTableFile = serde_yaml::from_str(text)?;
        Ok(Self {
            codes: file
                .codes
                .into_iter()
                .map(|entry| (normalize_label(&entry.label), entry.code))
                .collect(),
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TagTableError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| TagTableError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text).map_err(|source| TagTableError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn code_for(&self, label: &str) -> u32 {
        self.codes.get(&normalize_label(label)).copied().unwrap_or(0)
    }

    /// Sorted, de-duplicated codes; `[0]` when there are no tags.
    pub fn codes_for(&self, labels: &[String]) -> Vec<u32> {
        let codes: BTreeSet<u32> = labels.iter().map(|l| self.code_for(l)).collect();
        if codes.is_empty() {
            vec![0]
        } else {
            codes.into_iter().collect()
        }
    }
}

fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub source_name: String,
    pub max_description_len: usize,
    pub tag_codes: TagCodeTable,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            source_name: DEFAULT_SOURCE_NAME.to_string(),
            max_description_len: DEFAULT_MAX_DESCRIPTION_LEN,
            tag_codes: TagCodeTable::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub records: Vec<JobRecord>,
    pub counts: ValidationCounts,
}

/// Turns a slice of upstream listings into validated [`JobRecord`]s.
///
/// Pure: no I/O, no clock reads (the ingestion time is passed in). Each call
/// de-duplicates within its own input only; duplicates across calls are left
/// to the upsert's conflict handling.
#[derive(Debug, Clone, Default)]
pub struct RecordProcessor {
    config: ProcessorConfig,
}

impl RecordProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn process(&self, raw: Vec<JsonValue>, ingested_at: DateTime<Utc>) -> ProcessOutput {
        let mut seen: HashSet<String> = HashSet::with_capacity(raw.len());
        let mut counts = ValidationCounts::default();
        let mut records = Vec::with_capacity(raw.len());

        for item in raw {
            if !has_required_fields(&item) {
                counts.invalid += 1;
                continue;
            }

            let upstream_id = scalar_text(item.get(IDENTITY_FIELD));
            if let Some(id) = &upstream_id {
                if !seen.insert(id.clone()) {
                    debug!(id = %id, "duplicate listing dropped");
                    counts.duplicates += 1;
                    continue;
                }
            }

            let Some(record) = self.normalize(item, ingested_at) else {
                counts.invalid += 1;
                continue;
            };

            if upstream_id.is_none() && !seen.insert(record.id.clone()) {
                counts.duplicates += 1;
                continue;
            }

            counts.validated += 1;
            records.push(record);
        }

        ProcessOutput { records, counts }
    }

    /// Normalizes and repairs one listing; `None` when it fails final validation.
    fn normalize(&self, raw: JsonValue, ingested_at: DateTime<Utc>) -> Option<JobRecord> {
        let title = scalar_text(raw.get(TITLE_FIELD)).unwrap_or_default();
        let url = scalar_text(raw.get("url"))
            .map(|u| repair_url(&u))
            .unwrap_or_default();

        let locations_present = raw.get("locations").is_some();
        let locations = normalize_locations(raw.get("locations"));

        if title.is_empty() || url.is_empty() || (locations_present && locations.is_empty()) {
            debug!(title = %title, url = %url, "listing failed final validation");
            return None;
        }

        let id = scalar_text(raw.get(IDENTITY_FIELD)).unwrap_or_else(|| synthesize_id(&title, &url));
        let source = scalar_text(raw.get("source")).unwrap_or_else(|| self.config.source_name.clone());
        let description = scalar_text(raw.get("description"))
            .map(|d| truncate_chars(&d, self.config.max_description_len));
        let tags = normalize_tags(raw.get("tags"));
        let tag_codes = self.config.tag_codes.codes_for(&tags);
        let activation_time = ACTIVATION_FIELDS
            .iter()
            .find_map(|key| raw.get(*key).filter(|v| !v.is_null()))
            .map(parse_activation_time)
            .unwrap_or_else(|| ActivationTime::Unparsed(String::new()));

        Some(JobRecord {
            id,
            title,
            url,
            source,
            description,
            company: extract_company(&raw),
            locations,
            salary: normalize_salary(raw.get("salary")),
            salary_min: number(raw.get("normalizeSalaryMin")),
            salary_max: number(raw.get("normalizeSalaryMax")),
            tags,
            tag_codes,
            work_types: non_null_or(raw.get("workTypes"), json!([])),
            categories: non_null_or(raw.get("jobPostCategories"), json!([])),
            item_index: raw.get("itemIndex").and_then(integer),
            activation_time,
            ingested_at,
            raw,
        })
    }
}

fn has_required_fields(item: &JsonValue) -> bool {
    let Some(map) = item.as_object() else {
        return false;
    };
    map.contains_key(IDENTITY_FIELD)
        && map.contains_key(TITLE_FIELD)
        && ACTIVATION_FIELDS.iter().any(|k| map.contains_key(*k))
}

/// Stable identity for listings the upstream sent without one.
pub fn synthesize_id(title: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{title}-{url}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Adds an `https` scheme to scheme-less or protocol-relative urls.
pub fn repair_url(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() || url.contains("://") {
        return url.to_string();
    }
    match url.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => format!("https://{}", url.trim_start_matches('/')),
    }
}

/// Tries the known naive formats, then a date-only form, then RFC 3339.
pub fn parse_timestamp(text: &str) -> ActivationTime {
    let text = text.trim();
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return ActivationTime::Parsed(naive.and_utc());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(text, DATE_ONLY_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return ActivationTime::Parsed(midnight.and_utc());
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return ActivationTime::Parsed(ts.with_timezone(&Utc));
    }
    ActivationTime::Unparsed(text.to_string())
}

/// Accepts `{"date": ...}` wrappers, strings, and unix seconds.
pub fn parse_activation_time(value: &JsonValue) -> ActivationTime {
    match value {
        JsonValue::Object(map) => match map.get("date") {
            Some(inner) => parse_activation_time(inner),
            None => ActivationTime::Unparsed(value.to_string()),
        },
        JsonValue::String(text) => parse_timestamp(text),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .map(ActivationTime::Parsed)
            .unwrap_or_else(|| ActivationTime::Unparsed(n.to_string())),
        other => ActivationTime::Unparsed(other.to_string()),
    }
}

pub fn normalize_locations(value: Option<&JsonValue>) -> Vec<JsonValue> {
    match value {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
        Some(JsonValue::String(text)) => {
            let text = text.trim();
            if text.is_empty() {
                return Vec::new();
            }
            match serde_json::from_str::<JsonValue>(text) {
                Ok(JsonValue::Array(items)) => {
                    items.into_iter().filter(|v| !v.is_null()).collect()
                }
                Ok(obj @ JsonValue::Object(_)) => vec![obj],
                _ => vec![JsonValue::String(text.to_string())],
            }
        }
        Some(other) => vec![other.clone()],
    }
}

pub fn normalize_salary(value: Option<&JsonValue>) -> Salary {
    match value {
        None | Some(JsonValue::Null) => Salary::default(),
        Some(JsonValue::Object(map)) if SALARY_KEYS.iter().any(|k| map.contains_key(*k)) => {
            Salary::Range {
                min: number(map.get("min")),
                max: number(map.get("max")),
                currency: scalar_text(map.get("currency")),
                text: scalar_text(map.get("text")),
            }
        }
        Some(JsonValue::String(text)) => match serde_json::from_str::<JsonValue>(text) {
            Ok(parsed @ JsonValue::Object(_)) => normalize_salary(Some(&parsed)),
            _ => Salary::text(text.trim()),
        },
        Some(other) => Salary::text(other.to_string()),
    }
}

/// Zero-padded province/city ids joined by commas, e.g. `"008,001"`.
pub fn location_ids(locations: &[JsonValue]) -> String {
    let mut ids = Vec::new();
    for location in locations {
        for key in ["province", "city"] {
            match location.get(key).and_then(|v| v.get("id")) {
                Some(JsonValue::Number(n)) => {
                    if let Some(id) = n.as_u64() {
                        ids.push(format!("{id:03}"));
                    }
                }
                Some(JsonValue::String(s)) if !s.trim().is_empty() => ids.push(s.trim().to_string()),
                _ => {}
            }
        }
    }
    ids.join(",")
}

fn normalize_tags(value: Option<&JsonValue>) -> Vec<String> {
    let labels: Vec<String> = match value {
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|item| {
                scalar_text(Some(item))
                    .or_else(|| json_text(item, &["titleFa"]))
                    .or_else(|| json_text(item, &["title"]))
                    .or_else(|| json_text(item, &["name"]))
            })
            .collect(),
        Some(JsonValue::String(text)) => text
            .split(',')
            .filter_map(|s| text_or_none(s.to_string()))
            .collect(),
        _ => Vec::new(),
    };

    let mut seen = HashSet::new();
    labels.into_iter().filter(|l| seen.insert(l.clone())).collect()
}

fn extract_company(raw: &JsonValue) -> Company {
    let summary = raw.get("companyDetailsSummary").unwrap_or(&JsonValue::Null);
    Company {
        id: json_text(summary, &["id"]).or_else(|| scalar_text(raw.get("company_id"))),
        name_en: json_text(summary, &["name", "titleEn"])
            .or_else(|| scalar_text(raw.get("company_name_en")))
            .or_else(|| scalar_text(raw.get("company"))),
        name_native: json_text(summary, &["name", "titleFa"])
            .or_else(|| scalar_text(raw.get("companyFaName")))
            .or_else(|| scalar_text(raw.get("company_name_fa"))),
        about: json_text(summary, &["about", "titleFa"]),
        url: json_text(summary, &["url"]),
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Trimmed text for string fields; numbers and booleans are stringified.
fn scalar_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    scalar_text(Some(cur))
}

fn number(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

fn integer(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn non_null_or(value: Option<&JsonValue>, default: JsonValue) -> JsonValue {
    value.filter(|v| !v.is_null()).cloned().unwrap_or(default)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingested() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn listing(id: &str, title: &str) -> JsonValue {
        json!({
            "id": id,
            "title": title,
            "url": format!("jobs.example.com/{id}"),
            "activationTime": {"date": "2026-02-27T08:15:00.123"},
            "locations": [{"province": {"id": 8, "titleFa": "تهران"}, "city": {"id": 1}}],
        })
    }

    #[test]
    fn hundred_listings_with_duplicates_and_missing_titles() {
        let mut raw: Vec<JsonValue> = (0..92)
            .map(|i| listing(&format!("job-{i}"), &format!("Role {i}")))
            .collect();
        for i in 0..5 {
            raw.push(listing(&format!("job-{i}"), "Repeated role"));
        }
        for i in 0..3 {
            let mut item = listing(&format!("untitled-{i}"), "x");
            item.as_object_mut().unwrap().remove("title");
            raw.push(item);
        }
        assert_eq!(raw.len(), 100);

        let out = RecordProcessor::default().process(raw, ingested());

        assert_eq!(out.records.len(), 92);
        assert_eq!(
            out.counts,
            ValidationCounts {
                validated: 92,
                duplicates: 5,
                invalid: 3
            }
        );
        let ids: HashSet<_> = out.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 92);
    }

    #[test]
    fn synthesized_identity_is_deterministic() {
        let raw = json!({
            "id": null,
            "title": "  Data Engineer ",
            "url": "//careers.example.com/de",
            "activationTime": "2026-01-05",
        });
        let processor = RecordProcessor::default();

        let first = processor.process(vec![raw.clone()], ingested());
        let second = processor.process(vec![raw], ingested());

        let id = &first.records[0].id;
        assert_eq!(id, &second.records[0].id);
        assert_eq!(
            id,
            &synthesize_id("Data Engineer", "https://careers.example.com/de")
        );
        assert_eq!(id.len(), 64);
    }

    #[test]
    fn listings_without_an_upstream_id_are_deduplicated_by_synthesized_id() {
        let raw = json!({"id": "", "title": "Same", "url": "https://a.example/1", "postedDate": "2026-01-05"});
        let out = RecordProcessor::default().process(vec![raw.clone(), raw], ingested());
        assert_eq!(out.counts.validated, 1);
        assert_eq!(out.counts.duplicates, 1);
    }

    #[test]
    fn required_fields_are_checked_by_presence() {
        let missing_id = json!({"title": "t", "url": "u", "activationTime": "2026-01-01"});
        let missing_time = json!({"id": "1", "title": "t", "url": "u"});
        let non_object = json!("not a listing");
        let out = RecordProcessor::default()
            .process(vec![missing_id, missing_time, non_object], ingested());
        assert_eq!(out.counts.invalid, 3);
        assert!(out.records.is_empty());
    }

    #[test]
    fn numeric_ids_and_titles_are_coerced_to_strings() {
        let raw = json!({"id": 42, "title": 2026, "url": "https://x.example/42", "activationTime": "2026-01-01"});
        let dup = json!({"id": "42", "title": "again", "url": "https://x.example/42", "activationTime": "2026-01-01"});
        let out = RecordProcessor::default().process(vec![raw, dup], ingested());
        assert_eq!(out.records[0].id, "42");
        assert_eq!(out.records[0].title, "2026");
        assert_eq!(out.counts.duplicates, 1);
    }

    #[test]
    fn url_repair_adds_a_scheme() {
        assert_eq!(repair_url("//cdn.example.com/a"), "https://cdn.example.com/a");
        assert_eq!(repair_url("jobs.example.com/a"), "https://jobs.example.com/a");
        assert_eq!(repair_url("http://jobs.example.com"), "http://jobs.example.com");
        assert_eq!(repair_url("  "), "");
    }

    #[test]
    fn timestamps_parse_across_known_formats() {
        let cases = [
            "2026-02-27T08:15:00.123Z",
            "2026-02-27T08:15:00Z",
            "2026-02-27T08:15:00.5",
            "2026-02-27T08:15:00",
            "2026-02-27T08:15",
            "2026-02-27 08:15:00",
            "2026-02-27T08:15:00+00:00",
        ];
        for case in cases {
            match parse_timestamp(case) {
                ActivationTime::Parsed(ts) => {
                    assert_eq!(ts.format("%Y-%m-%d %H:%M").to_string(), "2026-02-27 08:15", "{case}")
                }
                other => panic!("{case} did not parse: {other:?}"),
            }
        }
        assert!(parse_timestamp("2026-02-27").is_parsed());
        assert_eq!(
            parse_timestamp("three days ago"),
            ActivationTime::Unparsed("three days ago".into())
        );
        assert!(parse_activation_time(&json!({"date": "2026-02-27T08:15"})).is_parsed());
        assert!(parse_activation_time(&json!(1_772_000_000)).is_parsed());
    }

    #[test]
    fn unparseable_activation_time_is_kept_verbatim() {
        let mut raw = listing("a", "Role");
        raw["activationTime"] = json!("soon");
        let out = RecordProcessor::default().process(vec![raw], ingested());
        assert_eq!(
            out.records[0].activation_time,
            ActivationTime::Unparsed("soon".into())
        );
    }

    #[test]
    fn locations_are_coerced_to_lists() {
        assert!(normalize_locations(None).is_empty());
        assert_eq!(
            normalize_locations(Some(&json!("Tehran"))),
            vec![json!("Tehran")]
        );
        assert_eq!(
            normalize_locations(Some(&json!("[{\"city\":{\"id\":3}}]"))),
            vec![json!({"city": {"id": 3}})]
        );
        assert_eq!(
            normalize_locations(Some(&json!({"city": "Shiraz"}))),
            vec![json!({"city": "Shiraz"})]
        );
    }

    #[test]
    fn present_but_empty_locations_fail_final_validation() {
        let mut empty = listing("a", "Role");
        empty["locations"] = json!([]);
        let mut absent = listing("b", "Role");
        absent.as_object_mut().unwrap().remove("locations");

        let out = RecordProcessor::default().process(vec![empty, absent], ingested());
        assert_eq!(out.counts.invalid, 1);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].id, "b");
        assert!(out.records[0].locations.is_empty());
    }

    #[test]
    fn salary_shapes_normalize_to_range_or_text() {
        assert_eq!(
            normalize_salary(Some(&json!({"min": "1,000", "max": 2000, "currency": "IRR"}))),
            Salary::Range {
                min: Some(1000.0),
                max: Some(2000.0),
                currency: Some("IRR".into()),
                text: None
            }
        );
        assert_eq!(
            normalize_salary(Some(&json!("{\"text\": \"negotiable\"}"))),
            Salary::Range {
                min: None,
                max: None,
                currency: None,
                text: Some("negotiable".into())
            }
        );
        assert_eq!(
            normalize_salary(Some(&json!("توافقی"))),
            Salary::text("توافقی")
        );
        assert_eq!(
            normalize_salary(Some(&json!([1, 2]))),
            Salary::text("[1,2]")
        );
        assert_eq!(normalize_salary(None), Salary::text(""));
    }

    #[test]
    fn description_is_truncated_and_source_defaulted() {
        let mut raw = listing("a", "Role");
        raw["description"] = json!("é".repeat(20));
        let processor = RecordProcessor::new(ProcessorConfig {
            source_name: "board".into(),
            max_description_len: 8,
            ..ProcessorConfig::default()
        });

        let out = processor.process(vec![raw], ingested());
        let record = &out.records[0];
        assert_eq!(record.description.as_deref(), Some("é".repeat(8).as_str()));
        assert_eq!(record.source, "board");
        assert_eq!(record.url, "https://jobs.example.com/a");
    }

    #[test]
    fn company_fields_come_from_the_details_summary() {
        let mut raw = listing("a", "Role");
        raw["companyDetailsSummary"] = json!({
            "id": 77,
            "name": {"titleEn": "Acme", "titleFa": "آکمه"},
            "about": {"titleFa": "about"},
            "url": "https://acme.example"
        });
        let out = RecordProcessor::default().process(vec![raw], ingested());
        let company = &out.records[0].company;
        assert_eq!(company.id.as_deref(), Some("77"));
        assert_eq!(company.name_en.as_deref(), Some("Acme"));
        assert_eq!(company.name_native.as_deref(), Some("آکمه"));
    }

    #[test]
    fn tag_codes_use_the_table_and_default_to_zero() {
        let table = TagCodeTable::default();
        assert_eq!(
            table.codes_for(&["کارآموزی".into(), "پاره وقت".into(), "unknown".into()]),
            vec![0, 1, 4]
        );
        assert_eq!(table.codes_for(&[]), vec![0]);

        let custom = TagCodeTable::from_yaml_str("codes:\n  - label: Remote\n    code: 9\n").unwrap();
        assert_eq!(custom.code_for("remote"), 9);
        assert_eq!(custom.code_for("part-time"), 0);
    }

    #[test]
    fn tag_table_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.yaml");
        std::fs::write(&path, "codes:\n  - label: contract\n    code: 5\n").unwrap();
        assert_eq!(TagCodeTable::from_path(&path).unwrap().code_for("Contract"), 5);
        assert!(matches!(
            TagCodeTable::from_path(dir.path().join("missing.yaml")),
            Err(TagTableError::Read { .. })
        ));
    }

    #[test]
    fn location_ids_are_zero_padded() {
        let locations = vec![
            json!({"province": {"id": 8}, "city": {"id": 1}}),
            json!({"province": {"id": "21"}}),
            json!("Remote"),
        ];
        assert_eq!(location_ids(&locations), "008,001,21");
    }
}
