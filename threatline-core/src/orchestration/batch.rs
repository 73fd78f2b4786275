//! Batch bookkeeping: per-member outcomes and the per-batch tally.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::RecordId;

/// Identifier for one dispatched batch; only used for correlation in logs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchId {
    /// Fresh time-ordered identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a single input item ended up. Every dispatched item lands in
/// exactly one of these.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Already stored before this item arrived; nothing was written.
    Duplicate,
    /// Rejected before any write.
    ValidationFailed,
    /// Settled as SCORED.
    Scored,
    /// Settled as FAILED, or the durable write itself failed.
    Failed,
    /// Stored with inference disabled; left in STORED for a later resume.
    Skipped,
    /// Durably written but left short of a terminal status; a later
    /// `resume` picks it up.
    StoredOnly,
}

/// What processing one input item produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RecordReport {
    pub offset: u64,
    pub record_id: Option<RecordId>,
    /// `None` when cancellation stopped the item before dispatch.
    pub outcome: Option<RecordOutcome>,
    /// True when this item performed the fresh durable write.
    pub ingested: bool,
    pub retries: u32,
}

impl RecordReport {
    pub fn not_dispatched(offset: u64) -> Self {
        Self {
            offset,
            record_id: None,
            outcome: None,
            ingested: false,
            retries: 0,
        }
    }

    pub fn settled(offset: u64, record_id: Option<RecordId>, outcome: RecordOutcome) -> Self {
        Self {
            offset,
            record_id,
            outcome: Some(outcome),
            ingested: false,
            retries: 0,
        }
    }

    pub fn ingested(mut self) -> Self {
        self.ingested = true;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Progress of one input item within its batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchMember {
    /// Absolute input offset.
    pub offset: u64,
    /// Absent for members that failed validation or were never dispatched.
    pub record_id: Option<RecordId>,
    /// Adapter retries spent on this member.
    pub retries: u32,
    /// `None` until the member settles.
    pub outcome: Option<RecordOutcome>,
}

/// Per-batch counts logged when a batch finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTally {
    /// Members that scored, were skipped, or were already stored.
    pub succeeded: usize,
    /// Members that failed validation, the write, or inference.
    pub failed: usize,
    /// Members that needed at least one retry.
    pub retried: usize,
}

/// Ephemeral grouping of input items dispatched together. Members are kept
/// in input order regardless of completion order.
#[derive(Clone, Debug)]
pub struct BatchJob {
    /// Correlation identifier for logs.
    pub id: BatchId,
    /// Absolute offset of the first member.
    pub start_offset: u64,
    members: Vec<BatchMember>,
}

impl BatchJob {
    /// Batch of `len` unsettled members starting at `start_offset`.
    pub fn new(start_offset: u64, len: usize) -> Self {
        let members = (0..len as u64)
            .map(|idx| BatchMember {
                offset: start_offset + idx,
                record_id: None,
                retries: 0,
                outcome: None,
            })
            .collect();
        Self {
            id: BatchId::new(),
            start_offset,
            members,
        }
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True for a batch with no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in input order.
    pub fn members(&self) -> &[BatchMember] {
        &self.members
    }

    /// Offset of the first item after this batch.
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.members.len() as u64
    }

    pub(crate) fn settle(&mut self, report: &RecordReport) {
        let Some(idx) = report.offset.checked_sub(self.start_offset) else {
            return;
        };
        if let Some(member) = self.members.get_mut(idx as usize) {
            member.record_id = report.record_id.clone();
            member.retries = report.retries;
            member.outcome = report.outcome;
        }
    }

    /// Every member reached an outcome.
    pub fn is_complete(&self) -> bool {
        self.members.iter().all(|member| member.outcome.is_some())
    }

    /// Counts members by outcome class.
    pub fn tally(&self) -> BatchTally {
        self.members
            .iter()
            .fold(BatchTally::default(), |mut tally, member| {
                match member.outcome {
                    Some(
                        RecordOutcome::Scored | RecordOutcome::Duplicate | RecordOutcome::Skipped,
                    ) => tally.succeeded += 1,
                    Some(RecordOutcome::Failed | RecordOutcome::ValidationFailed) => {
                        tally.failed += 1
                    }
                    Some(RecordOutcome::StoredOnly) | None => {}
                }
                if member.retries > 0 {
                    tally.retried += 1;
                }
                tally
            })
    }
}
