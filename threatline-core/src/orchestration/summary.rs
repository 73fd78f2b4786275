//! Run-level accounting.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::batch::{RecordOutcome, RecordReport};

/// Per-run accounting returned by the ingestion entrypoint.
///
/// Every dispatched input item is counted in `received` and in exactly one
/// of `duplicates`, `validation_failed`, `scored`, `failed`, `skipped` or
/// `stored_only`.
/// `ingested` counts fresh durable writes and overlaps with the outcome
/// buckets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    /// Identifier shared by every telemetry event of the run.
    pub run_id: Uuid,
    /// Items dispatched, whatever their outcome.
    pub received: u64,
    /// Fresh durable writes performed by this run.
    pub ingested: u64,
    /// Already stored; nothing written.
    pub duplicates: u64,
    /// Rejected by the validator.
    pub validation_failed: u64,
    /// Settled as SCORED.
    pub scored: u64,
    /// Settled as FAILED, or never durably written.
    pub failed: u64,
    /// Stored with inference disabled.
    #[serde(default)]
    pub skipped: u64,
    /// Stored but left in STORED or SCORING after an adapter error.
    pub stored_only: u64,
    /// Retries scheduled across all adapter calls.
    pub retries: u64,
    /// Batches pulled from the input, including an interrupted last one.
    pub batches: u64,
    /// Offset to restart from: the caller's start offset plus every item of
    /// fully completed batches.
    pub acknowledged_offset: u64,
    /// The run stopped because its cancellation token fired.
    pub cancelled: bool,
}

impl IngestSummary {
    /// Empty summary acknowledging up to `start_offset`.
    pub fn new(run_id: Uuid, start_offset: u64) -> Self {
        Self {
            run_id,
            acknowledged_offset: start_offset,
            ..Self::default()
        }
    }

    pub(crate) fn record(&mut self, report: &RecordReport) {
        let Some(outcome) = report.outcome else {
            return;
        };
        self.received += 1;
        self.retries += u64::from(report.retries);
        if report.ingested {
            self.ingested += 1;
        }
        match outcome {
            RecordOutcome::Duplicate => self.duplicates += 1,
            RecordOutcome::ValidationFailed => self.validation_failed += 1,
            RecordOutcome::Scored => self.scored += 1,
            RecordOutcome::Failed => self.failed += 1,
            RecordOutcome::Skipped => self.skipped += 1,
            RecordOutcome::StoredOnly => self.stored_only += 1,
        }
    }

    /// Sum of the outcome buckets equals `received`.
    pub fn is_balanced(&self) -> bool {
        self.received
            == self.duplicates
                + self.validation_failed
                + self.scored
                + self.failed
                + self.skipped
                + self.stored_only
    }
}
