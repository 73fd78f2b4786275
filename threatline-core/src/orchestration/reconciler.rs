//! Status transitions and conflict handling for stored records.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{AdapterError, PipelineError, Result};
use crate::ports::{RecordStore, UpdateOutcome};
use crate::record::{InferenceResult, RecordId, RecordStatus, StoredRecord};

/// Terminal verdict for a record handed to [`Reconciler::apply`].
#[derive(Clone, Debug, PartialEq)]
pub enum Verdict {
    /// Inference produced a valid score.
    Scored(InferenceResult),
    /// Retries ran out or the failure was permanent.
    Failed {
        /// Last error seen.
        reason: String,
    },
}

impl Verdict {
    /// Failure verdict carrying `reason`.
    pub fn failed(reason: impl Into<String>) -> Self {
        Verdict::Failed {
            reason: reason.into(),
        }
    }

    fn target_status(&self) -> RecordStatus {
        match self {
            Verdict::Scored(_) => RecordStatus::Scored,
            Verdict::Failed { .. } => RecordStatus::Failed,
        }
    }
}

/// What a reconciler call did to the stored record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The store now reflects the requested change.
    Applied,
    /// The store already held exactly this state; nothing was written.
    AlreadyApplied,
    /// A different terminal state got there first and was kept.
    Superseded(RecordStatus),
}

enum Plan {
    Write(StoredRecord),
    Keep(ReconcileOutcome),
}

/// Moves stored records through `STORED -> SCORING -> SCORED | FAILED`
/// using the store's compare-and-set. A conflicting concurrent update is
/// re-read and retried once before surfacing [`PipelineError::ReconcileConflict`].
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    call_timeout: Duration,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl Reconciler {
    /// Reconciler over `store`; each store call is bounded by `call_timeout`.
    pub fn new(store: Arc<dyn RecordStore>, call_timeout: Duration) -> Self {
        Self {
            store,
            call_timeout,
        }
    }

    /// `STORED -> SCORING`. A record already in SCORING is left as is so an
    /// interrupted run can pick it back up.
    pub async fn begin_scoring(&self, id: &RecordId) -> Result<ReconcileOutcome> {
        self.merge(id, |current| match current.status() {
            RecordStatus::Stored => {
                let mut next = current.clone();
                next.record.status = RecordStatus::Scoring;
                Ok(Plan::Write(next))
            }
            RecordStatus::Scoring => Ok(Plan::Keep(ReconcileOutcome::AlreadyApplied)),
            from => Err(PipelineError::InvalidTransition {
                id: id.clone(),
                from,
                to: RecordStatus::Scoring,
            }),
        })
        .await
    }

    /// Records a terminal verdict. Re-applying the same verdict is a no-op;
    /// a record that already reached a different terminal state keeps it.
    pub async fn apply(&self, id: &RecordId, verdict: Verdict) -> Result<ReconcileOutcome> {
        let outcome = self
            .merge(id, |current| {
                let status = current.status();
                if status.is_terminal() {
                    let same = match (&verdict, &current.result) {
                        (Verdict::Scored(new), Some(old)) => new.same_prediction(old),
                        (Verdict::Failed { .. }, _) => status == RecordStatus::Failed,
                        _ => false,
                    };
                    return Ok(Plan::Keep(if same {
                        ReconcileOutcome::AlreadyApplied
                    } else {
                        ReconcileOutcome::Superseded(status)
                    }));
                }

                let target = verdict.target_status();
                if !status.can_transition_to(target) {
                    return Err(PipelineError::InvalidTransition {
                        id: id.clone(),
                        from: status,
                        to: target,
                    });
                }
                let mut next = current.clone();
                next.record.status = target;
                match &verdict {
                    Verdict::Scored(result) => {
                        next.result = Some(result.clone());
                        next.failure = None;
                    }
                    Verdict::Failed { reason } => next.failure = Some(reason.clone()),
                }
                Ok(Plan::Write(next))
            })
            .await?;

        if let ReconcileOutcome::Superseded(kept) = outcome {
            debug!(
                target: "threatline::reconciler",
                record_id = %id,
                kept = %kept,
                "terminal state already recorded; keeping first result"
            );
        }
        Ok(outcome)
    }

    /// Explicitly replaces the result of a record that already reached a
    /// terminal state.
    pub async fn rescore(
        &self,
        id: &RecordId,
        result: InferenceResult,
    ) -> Result<ReconcileOutcome> {
        let outcome = self
            .merge(id, |current| {
                let status = current.status();
                if !status.is_terminal() {
                    return Err(PipelineError::InvalidTransition {
                        id: id.clone(),
                        from: status,
                        to: RecordStatus::Scored,
                    });
                }
                if status == RecordStatus::Scored && current.result.as_ref() == Some(&result) {
                    return Ok(Plan::Keep(ReconcileOutcome::AlreadyApplied));
                }
                let mut next = current.clone();
                next.record.status = RecordStatus::Scored;
                next.result = Some(result.clone());
                next.failure = None;
                Ok(Plan::Write(next))
            })
            .await?;

        if outcome == ReconcileOutcome::Applied {
            info!(
                target: "threatline::reconciler",
                record_id = %id,
                score = result.score,
                model_version = %result.model_version,
                "record rescored"
            );
        }
        Ok(outcome)
    }

    async fn merge<F>(&self, id: &RecordId, plan: F) -> Result<ReconcileOutcome>
    where
        F: Fn(&StoredRecord) -> Result<Plan>,
    {
        for attempt in 0..2 {
            let current = self
                .read(id)
                .await?
                .ok_or_else(|| PipelineError::RecordNotFound(id.clone()))?;

            let next = match plan(&current)? {
                Plan::Keep(outcome) => return Ok(outcome),
                Plan::Write(next) => next,
            };

            match self.update(current.version, next).await? {
                UpdateOutcome::Applied { .. } => return Ok(ReconcileOutcome::Applied),
                UpdateOutcome::NotFound => return Err(PipelineError::RecordNotFound(id.clone())),
                UpdateOutcome::Conflict => {
                    debug!(
                        target: "threatline::reconciler",
                        record_id = %id,
                        attempt,
                        expected_version = current.version,
                        "version conflict; re-reading"
                    );
                }
            }
        }
        Err(PipelineError::ReconcileConflict(id.clone()))
    }

    async fn read(&self, id: &RecordId) -> Result<Option<StoredRecord>> {
        tokio::time::timeout(self.call_timeout, self.store.get(id))
            .await
            .map_err(|_| AdapterError::timed_out("store read", self.call_timeout))?
            .map_err(PipelineError::from)
    }

    async fn update(&self, expected_version: u64, next: StoredRecord) -> Result<UpdateOutcome> {
        tokio::time::timeout(
            self.call_timeout,
            self.store.update_if_version(expected_version, next),
        )
        .await
        .map_err(|_| AdapterError::timed_out("store update", self.call_timeout))?
        .map_err(PipelineError::from)
    }
}
