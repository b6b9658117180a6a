//! Field report data model

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::backend::User;

/// Prefix of ids given to reports created while offline
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Metadata of a file attached to a report; no content is carried
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub file_type: String,
}

/// A field report as held in memory and in the local cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub id: String,
    pub report_type: String,
    pub location: String,
    pub title: String,
    pub description: String,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<FileMeta>,
}

impl Report {
    /// Build a not-yet-synced report from a draft
    pub fn offline(draft: NewReport, id: String, submitted_at: DateTime<Utc>) -> Self {
        Self {
            id,
            report_type: draft.report_type,
            location: draft.location,
            title: draft.title,
            description: draft.description,
            submitted_at,
            files: draft.files,
        }
    }

    /// True for reports created offline and never confirmed by the backend
    pub fn is_pending(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }
}

/// A report as submitted by the user, before it has an id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReport {
    pub report_type: String,
    pub location: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<FileMeta>,
}

impl NewReport {
    /// Row inserted into the backend collection
    pub fn to_record(&self, user_id: &str) -> Value {
        json!({
            "report_type": self.report_type,
            "location": self.location,
            "title": self.title,
            "description": self.description,
            "files": self.files,
            "user_id": user_id,
        })
    }
}

/// Raw row of the backend collection
#[derive(Debug, Clone, Deserialize)]
pub struct ReportRow {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub report_type: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(deserialize_with = "lenient_timestamp")]
    pub submitted_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub files: Vec<FileMeta>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl From<ReportRow> for Report {
    fn from(row: ReportRow) -> Self {
        Self {
            id: row.id,
            report_type: row.report_type,
            location: row.location,
            title: row.title,
            description: row.description,
            submitted_at: row.submitted_at,
            files: row.files,
        }
    }
}

/// Transform fetched rows into reports, newest first.
///
/// Rows that do not decode are skipped. The sort is stable so equal
/// timestamps keep the backend's order.
pub fn reports_from_rows(rows: Vec<Value>) -> Vec<Report> {
    let mut reports: Vec<Report> = rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value::<ReportRow>(row) {
            Ok(row) => Some(row.into()),
            Err(e) => {
                warn!("Skipping malformed report row: {}", e);
                None
            }
        })
        .collect();
    reports.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
    reports
}

/// The signed-in user as far as this core cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: String,
    pub email: Option<String>,
}

impl From<&User> for CurrentUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid id: {}", other))),
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<FileMeta>, D::Error> {
    Ok(Option::<Vec<FileMeta>>::deserialize(deserializer)?.unwrap_or_default())
}

// Postgres hands out `timestamptz` as RFC 3339, plain `timestamp` without an
// offset and `date` as a bare day; all are read as UTC.
fn lenient_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ts.and_utc());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ts.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}
