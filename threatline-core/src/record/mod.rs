//! Attack record model and the persisted layout shared by every store.

pub mod canonical;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

pub use canonical::{canonical_json, derive_id};

/// Attribute bag of a validated record. Ordered so that iteration and
/// serialization are stable.
pub type Attributes = BTreeMap<String, Value>;

/// Content-derived identifier: lowercase hex SHA-256, 64 characters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    /// Length of the hex encoding.
    pub const LEN: usize = 64;

    /// Full hex identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == Self::LEN
            && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(ValidationError::new(
                "id",
                "expected 64 lowercase hexadecimal characters",
            ))
        }
    }
}

impl TryFrom<String> for RecordId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

/// Lifecycle of a record. Transitions only move forward:
/// `PENDING -> STORED -> SCORING -> SCORED | FAILED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    /// Validated, not yet written.
    Pending,
    /// Durably written; inference not started.
    Stored,
    /// Inference in progress.
    Scoring,
    /// Terminal: a score is attached.
    Scored,
    /// Terminal: inference or feature extraction failed.
    Failed,
}

impl RecordStatus {
    /// Persisted spelling, e.g. `SCORING`.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Pending => "PENDING",
            RecordStatus::Stored => "STORED",
            RecordStatus::Scoring => "SCORING",
            RecordStatus::Scored => "SCORED",
            RecordStatus::Failed => "FAILED",
        }
    }

    /// SCORED or FAILED.
    pub fn is_terminal(self) -> bool {
        matches!(self, RecordStatus::Scored | RecordStatus::Failed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        matches!(
            (self, next),
            (Pending, Stored)
                | (Stored, Scoring)
                | (Stored, Failed)
                | (Scoring, Scored)
                | (Scoring, Failed)
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RecordStatus::Pending),
            "STORED" => Ok(RecordStatus::Stored),
            "SCORING" => Ok(RecordStatus::Scoring),
            "SCORED" => Ok(RecordStatus::Scored),
            "FAILED" => Ok(RecordStatus::Failed),
            other => Err(ValidationError::new(
                "status",
                format!("unknown record status `{other}`"),
            )),
        }
    }
}

/// A validated, canonical attack record. Immutable once ingested apart from
/// its lifecycle status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttackRecord {
    /// Derived from `kind` and `attributes`.
    pub id: RecordId,
    /// Schema namespace folded into the identifier.
    pub kind: String,
    /// Event time, normalized to UTC.
    pub timestamp: DateTime<Utc>,
    /// Canonical attribute map, including the required fields.
    pub attributes: Attributes,
    /// Lifecycle status.
    pub status: RecordStatus,
}

impl AttackRecord {
    /// Canonical source address.
    pub fn source_ip(&self) -> Option<&str> {
        self.attributes.get("source_ip").and_then(Value::as_str)
    }

    /// Canonical destination address.
    pub fn destination_ip(&self) -> Option<&str> {
        self.attributes.get("destination_ip").and_then(Value::as_str)
    }

    /// Attack category label.
    pub fn category(&self) -> Option<&str> {
        self.attributes.get("category").and_then(Value::as_str)
    }

    /// Looks up an attribute by name, falling back to a dotted path into
    /// nested objects (`src.port`).
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        lookup(&self.attributes, name)
    }
}

/// Model output attached to a record on successful inference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    /// Model score in `[0.0, 1.0]`.
    pub score: f64,
    /// Version reported by the adapter that produced the score.
    pub model_version: String,
    /// When the score was produced.
    pub scored_at: DateTime<Utc>,
}

impl InferenceResult {
    /// Builds a result, rejecting scores outside `[0.0, 1.0]`.
    pub fn new(score: f64, model_version: impl Into<String>) -> Result<Self, ValidationError> {
        if !(0.0..=1.0).contains(&score) {
            return Err(ValidationError::new(
                "score",
                format!("score {score} is outside [0.0, 1.0]"),
            ));
        }
        Ok(Self {
            score,
            model_version: model_version.into(),
            scored_at: Utc::now(),
        })
    }

    /// Same prediction regardless of when it was produced.
    pub fn same_prediction(&self, other: &InferenceResult) -> bool {
        self.score == other.score && self.model_version == other.model_version
    }
}

/// Persisted layout `{id, status, payload, result?, updated_at, version}`.
/// `version` is the compare-and-set token and is owned by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// The payload; its `status` is the lifecycle status.
    pub record: AttackRecord,
    /// Present once SCORED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<InferenceResult>,
    /// Reason recorded when FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
    /// Compare-and-set token; bumped by the store on every update.
    pub version: u64,
}

impl StoredRecord {
    /// Wraps a freshly validated record for its first durable write.
    pub fn stored(mut record: AttackRecord) -> Self {
        record.status = RecordStatus::Stored;
        Self {
            record,
            result: None,
            failure: None,
            updated_at: Utc::now(),
            version: 0,
        }
    }

    /// Identifier of the wrapped record.
    pub fn id(&self) -> &RecordId {
        &self.record.id
    }

    /// Current lifecycle status.
    pub fn status(&self) -> RecordStatus {
        self.record.status
    }
}

/// Resolves `name` against `attributes`: a direct key wins, otherwise the
/// name is treated as a dotted path into nested objects.
pub(crate) fn lookup<'a>(attributes: &'a Attributes, name: &str) -> Option<&'a Value> {
    if let Some(value) = attributes.get(name) {
        return Some(value);
    }
    let mut segments = name.split('.');
    let first = segments.next()?;
    let mut current = attributes.get(first)?;
    let mut descended = false;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
        descended = true;
    }
    descended.then_some(current)
}
