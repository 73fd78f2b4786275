//! Side-channel operational events.
//!
//! Stages hand events to a [`TelemetryEmitter`], which never blocks and never
//! fails the caller. A background task drains them into a [`TelemetrySink`].

mod emitter;
mod sinks;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::record::RecordId;

pub use emitter::TelemetryEmitter;
pub use sinks::{BroadcastSink, FanoutSink, JsonlSink, TracingSink};

/// What happened to a record at a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    /// A fresh durable write landed.
    Ingested,
    /// The identifier was already stored; nothing was written.
    DuplicateSkipped,
    /// The raw item was rejected before any write.
    ValidationFailed,
    /// The durable write never succeeded.
    WriteFailed,
    /// A transient adapter error scheduled another attempt.
    InferenceRetry,
    /// The record settled as FAILED.
    InferenceFailed,
    /// Inference is disabled; the record stays STORED for a later resume.
    InferenceSkipped,
    /// The record settled as SCORED.
    Scored,
}

impl TelemetryKind {
    /// Wire name of the kind, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            TelemetryKind::Ingested => "ingested",
            TelemetryKind::DuplicateSkipped => "duplicate_skipped",
            TelemetryKind::ValidationFailed => "validation_failed",
            TelemetryKind::WriteFailed => "write_failed",
            TelemetryKind::InferenceRetry => "inference_retry",
            TelemetryKind::InferenceFailed => "inference_failed",
            TelemetryKind::InferenceSkipped => "inference_skipped",
            TelemetryKind::Scored => "scored",
        }
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage that raised an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Schema validation and identifier derivation.
    Validate,
    /// The conditional durable write.
    Write,
    /// The inference call and its retries.
    Infer,
    /// Status transitions applied after inference.
    Reconcile,
}

impl Stage {
    /// Wire name of the stage, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Write => "write",
            Stage::Infer => "infer",
            Stage::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed stage transition. `record_id` is absent for inputs that
/// never produced an identifier; `offset` locates them in the input instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Run that produced the event.
    pub run_id: Uuid,
    /// What happened.
    pub kind: TelemetryKind,
    /// Where it happened.
    pub stage: Stage,
    /// Absent when validation failed before an identifier existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    /// Absolute input offset; absent for events raised by `resume`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Retry number for `inference_retry` events, starting at 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Free-form context such as an error message or the score.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Wall-clock time the event was created.
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    /// Event stamped with the current time and no optional fields.
    pub fn new(run_id: Uuid, kind: TelemetryKind, stage: Stage) -> Self {
        Self {
            run_id,
            kind,
            stage,
            record_id: None,
            offset: None,
            attempt: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    /// Attaches the record identifier.
    pub fn with_record(mut self, id: &RecordId) -> Self {
        self.record_id = Some(id.clone());
        self
    }

    /// Attaches the absolute input offset.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Attaches the retry number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Attaches free-form context.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Why a sink could not take an event. The emitter logs these and drops the
/// event.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Writing to the sink's file failed.
    #[error("telemetry I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The event could not be encoded.
    #[error("telemetry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sink no longer accepts events.
    #[error("telemetry sink closed")]
    Closed,
}

/// Consumer of telemetry events: a log pipeline, a metrics bridge, a file.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Takes ownership of one event.
    async fn accept(&self, event: TelemetryEvent) -> Result<(), TelemetryError>;
}
