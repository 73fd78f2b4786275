//! Error types for validation, adapters, and the pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::record::{RecordId, RecordStatus};

/// A raw record was rejected by the validator. Always names the offending
/// field; never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid field `{field}`: {reason}")]
pub struct ValidationError {
    /// Canonical name of the offending field.
    pub field: String,
    /// Human-readable explanation.
    pub reason: String,
}

impl ValidationError {
    /// Rejection of `field` for `reason`.
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// A required field was absent or null.
    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "required field is missing")
    }
}

/// Error taxonomy shared by every external adapter. The coordinator only
/// looks at the class to decide retry eligibility.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Timeouts, throttling, 5xx, dropped connections. Retried with backoff.
    #[error("transient adapter error: {0}")]
    Transient(String),

    /// Malformed input, rejected requests, 4xx. Never retried.
    #[error("permanent adapter error: {0}")]
    Permanent(String),
}

impl AdapterError {
    /// Retryable error carrying `msg`.
    pub fn transient(msg: impl Into<String>) -> Self {
        AdapterError::Transient(msg.into())
    }

    /// Non-retryable error carrying `msg`.
    pub fn permanent(msg: impl Into<String>) -> Self {
        AdapterError::Permanent(msg.into())
    }

    /// Transient error for a call that exceeded its deadline.
    pub fn timed_out(operation: &str, after: Duration) -> Self {
        AdapterError::Transient(format!(
            "{operation} timed out after {}ms",
            after.as_millis()
        ))
    }

    /// True for [`AdapterError::Transient`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }

    /// Message without the class prefix.
    pub fn message(&self) -> &str {
        match self {
            AdapterError::Transient(msg) | AdapterError::Permanent(msg) => msg,
        }
    }
}

/// Errors surfaced by coordinator construction and the reconciler.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A record failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An adapter call failed and was not recovered.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// A conditional update kept conflicting after the single re-read.
    #[error("reconcile conflict on record {0}: concurrent update persisted after retry")]
    ReconcileConflict(RecordId),

    /// The store has no record with this identifier.
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    /// The requested status change is not allowed from the current status.
    #[error("record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Record being updated.
        id: RecordId,
        /// Status found in the store.
        from: RecordStatus,
        /// Status that was requested.
        to: RecordStatus,
    },

    /// Pipeline configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A persisted payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Configuration error carrying `msg`.
    pub fn configuration(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
