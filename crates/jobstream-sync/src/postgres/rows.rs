use chrono::{DateTime, Utc};
use jobstream_core::{Batch, JobRecord};
use jobstream_records::location_ids;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::warn;
use uuid::Uuid;

/// Column order shared by the staging insert and the merge statement.
pub const JOB_COLUMNS: [&str; 24] = [
    "id",
    "title",
    "url",
    "source",
    "description",
    "company_id",
    "company_name_en",
    "company_name_native",
    "company_about",
    "company_url",
    "locations",
    "location_ids",
    "salary",
    "salary_min",
    "salary_max",
    "tags",
    "tag_codes",
    "work_types",
    "categories",
    "item_index",
    "activation_time",
    "raw_data",
    "batch_id",
    "batch_date",
];

/// A record cast to the column types of the `jobs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub title: String,
    pub url: String,
    pub source: String,
    pub description: Option<String>,
    pub company_id: Option<String>,
    pub company_name_en: Option<String>,
    pub company_name_native: Option<String>,
    pub company_about: Option<String>,
    pub company_url: Option<String>,
    pub locations: JsonValue,
    pub location_ids: String,
    pub salary: JsonValue,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub tags: JsonValue,
    pub tag_codes: String,
    pub work_types: JsonValue,
    pub categories: JsonValue,
    pub item_index: Option<i64>,
    pub activation_time: DateTime<Utc>,
    pub raw_data: JsonValue,
    pub batch_id: Uuid,
    pub batch_date: DateTime<Utc>,
}

impl JobRow {
    pub fn from_record(record: &JobRecord, batch: &Batch) -> Self {
        let company = &record.company;
        let tag_codes = if record.tag_codes.is_empty() {
            "0".to_string()
        } else {
            record
                .tag_codes
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };

        Self {
            id: record.id.clone(),
            title: record.title.clone(),
            url: record.url.clone(),
            source: record.source.clone(),
            description: record.description.clone(),
            company_id: company.id.clone(),
            company_name_en: company.name_en.clone(),
            company_name_native: company.name_native.clone(),
            company_about: company.about.clone(),
            company_url: company.url.clone(),
            locations: to_json(&record.id, "locations", &record.locations, json!([])),
            location_ids: location_ids(&record.locations),
            salary: to_json(&record.id, "salary", &record.salary, json!({})),
            salary_min: finite(record.salary_min).or_else(|| finite(record.salary.min())),
            salary_max: finite(record.salary_max).or_else(|| finite(record.salary.max())),
            tags: to_json(&record.id, "tags", &record.tags, json!([])),
            tag_codes,
            work_types: collection_or_empty(&record.work_types),
            categories: collection_or_empty(&record.categories),
            item_index: record.item_index,
            activation_time: record.activation_time.resolve(batch.batch_date),
            raw_data: record.raw.clone(),
            batch_id: batch.batch_id,
            batch_date: batch.batch_date,
        }
    }
}

fn to_json<T: Serialize + ?Sized>(
    id: &str,
    field: &'static str,
    value: &T,
    fallback: JsonValue,
) -> JsonValue {
    match serde_json::to_value(value) {
        Ok(value) => value,
        Err(err) => {
            warn!(id, field, error = %err, "field not serializable; storing empty default");
            fallback
        }
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn collection_or_empty(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Null => json!([]),
        other => other.clone(),
    }
}
