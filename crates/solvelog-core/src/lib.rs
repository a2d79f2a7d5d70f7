//! Core domain model for solvelog.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "solvelog-core";

/// Layout of the judge's submission timestamp (`title` attribute of the time link).
pub const SUBMITTED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Opaque identifier of a tracked judge account.
pub type Username = String;

/// Identity of a persisted submission. At most one record per key may exist.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub username: Username,
    pub problem_id: String,
}

impl RecordKey {
    pub fn new(username: impl Into<Username>, problem_id: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            problem_id: problem_id.into(),
        }
    }
}

/// One accepted submission, as extracted from a status page and persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub username: Username,
    pub problem_id: String,
    pub submission_id: String,
    pub problem_url: String,
    #[serde(with = "submitted_at_format")]
    pub submitted_at: NaiveDateTime,
    pub memory_used: String,
    pub time_spent: String,
}

impl SubmissionRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.username.clone(), self.problem_id.clone())
    }
}

pub fn parse_submitted_at(raw: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw.trim(), SUBMITTED_AT_FORMAT)
}

pub fn format_submitted_at(value: &NaiveDateTime) -> String {
    value.format(SUBMITTED_AT_FORMAT).to_string()
}

mod submitted_at_format {
    use chrono::NaiveDateTime;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_submitted_at(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_submitted_at(&raw).map_err(D::Error::custom)
    }
}
