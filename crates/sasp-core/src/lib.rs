//! Core domain model for the assessment stats pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sasp-core";

/// Point-in-time snapshot of user-level stats as received from the
/// assessment service. Append-only; a new row per fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUserStats {
    pub id: Uuid,
    pub student_id: Uuid,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub error_message: Option<String>,
}

/// Staged attempt payload, upsertable by its external natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAttempt {
    pub id: Uuid,
    pub external_attempt_id: Uuid,
    pub student_id: Uuid,
    pub test_id: Option<Uuid>,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub processing_attempts: i32,
    pub error_message: Option<String>,
}

/// Canonical attempt record. Single source of truth for aggregation and
/// certificate eligibility; keyed by the external attempt id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub test_id: Option<Uuid>,
    pub date_of_attempt: NaiveDate,
    pub point: Option<f64>,
    pub result: Value,
    pub completed: bool,
    pub passed: bool,
    pub certificate_id: Option<Uuid>,
    pub snapshot_ref: Option<String>,
    pub version: Option<Value>,
    pub meta: Value,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' is not a valid {expected}: {value}")]
    BadField {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
}

fn require_uuid(payload: &Value, field: &'static str) -> Result<Uuid, PayloadError> {
    let raw = payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or(PayloadError::MissingField(field))?;
    raw.parse().map_err(|_| PayloadError::BadField {
        field,
        expected: "uuid",
        value: raw.to_string(),
    })
}

fn optional_uuid(payload: &Value, field: &'static str) -> Result<Option<Uuid>, PayloadError> {
    match payload.get(field).and_then(Value::as_str) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| PayloadError::BadField {
                field,
                expected: "uuid",
                value: raw.to_string(),
            }),
    }
}

impl AttemptRecord {
    /// Transform a validated `attempt_detail` payload into the canonical
    /// shape. The payload has already passed contract validation; this only
    /// guards the fields the contract leaves loose.
    pub fn from_payload(payload: &Value) -> Result<Self, PayloadError> {
        let id = require_uuid(payload, "attempt_id")?;
        let student_id = require_uuid(payload, "student_id")?;
        let test_id = optional_uuid(payload, "test_id")?;
        let certificate_id = optional_uuid(payload, "certificate_id")?;

        let date_raw = payload
            .get("date_of_attempt")
            .and_then(Value::as_str)
            .ok_or(PayloadError::MissingField("date_of_attempt"))?;
        // Accept bare dates and full RFC 3339 timestamps.
        let date_of_attempt = date_raw
            .parse::<NaiveDate>()
            .or_else(|_| {
                date_raw
                    .parse::<DateTime<Utc>>()
                    .map(|dt| dt.date_naive())
            })
            .map_err(|_| PayloadError::BadField {
                field: "date_of_attempt",
                expected: "date",
                value: date_raw.to_string(),
            })?;

        Ok(Self {
            id,
            student_id,
            test_id,
            date_of_attempt,
            point: payload.get("point").and_then(Value::as_f64),
            result: payload
                .get("result")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default())),
            completed: payload
                .get("completed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            passed: payload
                .get("passed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            certificate_id,
            snapshot_ref: payload
                .get("attempt_snapshot_s3")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            version: payload.get("attempt_version").cloned(),
            meta: payload
                .get("meta")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default())),
        })
    }

    /// Maximum achievable score for this attempt, read from the result blob.
    pub fn max_score(&self) -> f64 {
        self.result
            .get("max_score")
            .and_then(Value::as_f64)
            .unwrap_or(100.0)
    }

    pub fn course_id(&self) -> Option<Uuid> {
        self.meta
            .get("course_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    pub fn course_name(&self) -> String {
        self.meta
            .get("course_name")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| "Unknown course".to_string())
    }
}

/// Per-student aggregate recomputed wholesale from canonical attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentStats {
    pub student_id: Uuid,
    pub total_attempts: i64,
    pub passed_attempts: i64,
    pub failed_attempts: i64,
    pub avg_score: f64,
    pub total_tests_taken: i64,
    pub last_attempt_at: Option<NaiveDate>,
}

impl StudentStats {
    pub fn empty(student_id: Uuid) -> Self {
        Self {
            student_id,
            total_attempts: 0,
            passed_attempts: 0,
            failed_attempts: 0,
            avg_score: 0.0,
            total_tests_taken: 0,
            last_attempt_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: Uuid,
    pub student_id: Uuid,
    pub course_id: Option<Uuid>,
    pub test_attempt_id: Uuid,
    pub storage_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Stats + certificates grouped by course, the payload behind "get stats".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatistics {
    pub statistics: StudentStats,
    pub certificates: BTreeMap<String, Vec<Certificate>>,
}

/// Composed bundle cached under one key and invalidated as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullProfile {
    pub statistics: StudentStats,
    pub certificates: BTreeMap<String, Vec<Certificate>>,
    pub recent_attempts: Vec<AttemptRecord>,
    pub raw_stats_history: Vec<RawUserStats>,
}

/// Group certificates by course id; certificates with no course land under
/// "uncategorized".
pub fn group_certificates_by_course(
    certificates: Vec<Certificate>,
) -> BTreeMap<String, Vec<Certificate>> {
    let mut grouped: BTreeMap<String, Vec<Certificate>> = BTreeMap::new();
    for cert in certificates {
        let key = cert
            .course_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "uncategorized".to_string());
        grouped.entry(key).or_default().push(cert);
    }
    grouped
}
