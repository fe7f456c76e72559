use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Content types requested from the learning activity report.
pub const CONTENT_TYPE_FILTER: &str = "Course,Assessment";

/// Upstream status marking a report job that will never produce rows.
pub const FAILED_STATUS: &str = "FAILED";

/// One learning activity observation (user x content x status).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportRow {
    #[serde(deserialize_with = "null_as_empty")]
    pub user_id: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub first_name: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub last_name: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub email_address: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub content_id: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub content_title: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub content_type: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_access: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_access: Option<String>,
}

pub type Report = Vec<ReportRow>;

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// State of an asynchronous report job as returned by the reporting API.
/// Missing fields decode as empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStatus {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReportStatus {
    pub fn is_failed(&self) -> bool {
        self.status == FAILED_STATUS
    }
}

/// Body of the report generation request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub content_type: String,
}

impl ReportRequest {
    pub fn for_window(now: DateTime<Utc>, lookback: Duration) -> Self {
        Self {
            start: now - lookback,
            end: now,
            content_type: CONTENT_TYPE_FILTER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl From<&ReportRow> for User {
    fn from(row: &ReportRow) -> Self {
        Self {
            id: row.user_id.clone(),
            email: row.email_address.clone(),
            first_name: row.first_name.clone(),
            last_name: row.last_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Course {
    pub id: String,
    pub title: String,
}

/// Completion status after normalizing the upstream free-text value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedStatus {
    Completed,
    InProgress,
    NoStatusReported,
    StatusUndefined,
}

impl NormalizedStatus {
    pub const ALL: [NormalizedStatus; 4] = [
        NormalizedStatus::Completed,
        NormalizedStatus::InProgress,
        NormalizedStatus::NoStatusReported,
        NormalizedStatus::StatusUndefined,
    ];

    /// Case-sensitive mapping of the upstream status vocabulary.
    pub fn from_upstream(status: &str) -> Self {
        match status {
            "" => NormalizedStatus::NoStatusReported,
            "Completed" | "Achieved" | "Listened" | "Read" | "Watched" => {
                NormalizedStatus::Completed
            }
            "Started" | "Active" => NormalizedStatus::InProgress,
            _ => NormalizedStatus::StatusUndefined,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NormalizedStatus::Completed => "completed",
            NormalizedStatus::InProgress => "in_progress",
            NormalizedStatus::NoStatusReported => "no_status_reported",
            NormalizedStatus::StatusUndefined => "status_undefined",
        }
    }
}

impl std::fmt::Display for NormalizedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
