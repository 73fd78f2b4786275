//! The batch coordinator: the ingestion entrypoint.

use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;

use dashmap::DashSet;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::batch::{BatchJob, RecordOutcome, RecordReport};
use super::config::PipelineConfig;
use super::reconciler::{ReconcileOutcome, Reconciler, Verdict};
use super::retry::{BackoffPolicy, call_with_retry};
use super::summary::IngestSummary;
use crate::error::{AdapterError, Result};
use crate::ports::{InferenceAdapter, PutOutcome, RecordStore};
use crate::record::{AttackRecord, InferenceResult, RecordId, RecordStatus, StoredRecord};
use crate::telemetry::{Stage, TelemetryEmitter, TelemetryEvent, TelemetryKind};
use crate::validation::RecordValidator;

/// Drives raw input through validate -> write -> infer -> reconcile.
///
/// Input is consumed lazily in batches of at most `batch_size`: whatever is
/// ready is dispatched without waiting for a full batch. Batches run one after
/// another and the members of a batch run with at most `max_concurrency` in
/// flight. Per-record failures never abort the run: every dispatched item is
/// accounted for in the returned [`IngestSummary`].
///
/// A coordinator built with [`store_only`](Self::store_only) writes records
/// and leaves them STORED; a later [`resume`](Self::resume) with inference
/// attached scores them.
pub struct BatchCoordinator {
    config: PipelineConfig,
    validator: RecordValidator,
    store: Arc<dyn RecordStore>,
    inference: Option<Arc<dyn InferenceAdapter>>,
    reconciler: Reconciler,
    telemetry: TelemetryEmitter,
    backoff: BackoffPolicy,
}

impl fmt::Debug for BatchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("batch_size", &self.config.batch_size)
            .field("max_concurrency", &self.config.max_concurrency)
            .field("max_retries", &self.backoff.max_retries())
            .field(
                "model_version",
                &self.inference.as_ref().map(|adapter| adapter.model_version()),
            )
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

impl BatchCoordinator {
    /// Fails with a configuration error before any I/O when `config` is
    /// unusable.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn RecordStore>,
        inference: Arc<dyn InferenceAdapter>,
        telemetry: TelemetryEmitter,
    ) -> Result<Self> {
        Self::assemble(config, store, Some(inference), telemetry)
    }

    /// Coordinator with inference disabled. Written records are reported as
    /// skipped and stay STORED.
    pub fn store_only(
        config: PipelineConfig,
        store: Arc<dyn RecordStore>,
        telemetry: TelemetryEmitter,
    ) -> Result<Self> {
        Self::assemble(config, store, None, telemetry)
    }

    fn assemble(
        config: PipelineConfig,
        store: Arc<dyn RecordStore>,
        inference: Option<Arc<dyn InferenceAdapter>>,
        telemetry: TelemetryEmitter,
    ) -> Result<Self> {
        config.validate()?;
        let validator = RecordValidator::new(config.schema.clone());
        let reconciler = Reconciler::new(Arc::clone(&store), config.call_timeout());
        let backoff = BackoffPolicy::new(&config.retry);
        Ok(Self {
            config,
            validator,
            store,
            inference,
            reconciler,
            telemetry,
            backoff,
        })
    }

    /// Validated pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validator built from the configured schema.
    pub fn validator(&self) -> &RecordValidator {
        &self.validator
    }

    /// Reconciler writing to the same store.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Emitter every stage reports to.
    pub fn telemetry(&self) -> &TelemetryEmitter {
        &self.telemetry
    }

    /// False for a [`store_only`](Self::store_only) coordinator.
    pub fn infers(&self) -> bool {
        self.inference.is_some()
    }

    /// Ingests `input` from offset 0. Never fails as a whole; per-record
    /// failures are counted in the summary.
    pub async fn submit<S>(&self, input: S, cancel: &CancellationToken) -> IngestSummary
    where
        S: Stream<Item = Value>,
    {
        self.submit_from(0, input, cancel).await
    }

    /// Like [`submit`](Self::submit) for input that resumes at
    /// `start_offset`. Offsets in events and in the summary are absolute.
    pub async fn submit_from<S>(
        &self,
        start_offset: u64,
        input: S,
        cancel: &CancellationToken,
    ) -> IngestSummary
    where
        S: Stream<Item = Value>,
    {
        let claims = DashSet::new();
        self.drive("ingest", start_offset, input, cancel, |run_id, offset, raw| {
            self.ingest_one(run_id, offset, raw, &claims, cancel)
        })
        .await
    }

    /// Re-drives stored records that never reached a terminal status (left in
    /// STORED or SCORING by an interrupted run). Terminal records are
    /// reported as duplicates and left alone.
    pub async fn resume<S>(&self, ids: S, cancel: &CancellationToken) -> IngestSummary
    where
        S: Stream<Item = RecordId>,
    {
        self.drive("resume", 0, ids, cancel, |run_id, offset, id| {
            self.resume_one(run_id, offset, id, cancel)
        })
        .await
    }

    async fn drive<S, T, F, Fut>(
        &self,
        mode: &'static str,
        start_offset: u64,
        input: S,
        cancel: &CancellationToken,
        process: F,
    ) -> IngestSummary
    where
        S: Stream<Item = T>,
        F: Fn(Uuid, u64, T) -> Fut,
        Fut: Future<Output = RecordReport>,
    {
        let run_id = Uuid::now_v7();
        let mut summary = IngestSummary::new(run_id, start_offset);
        let mut batches = pin!(input.ready_chunks(self.config.batch_size));
        let mut next_offset = start_offset;

        info!(
            target: "threatline::coordinator",
            %run_id,
            mode,
            start_offset,
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            "run started"
        );

        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let items = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                next = batches.next() => match next {
                    Some(items) => items,
                    None => break,
                },
            };

            let mut batch = BatchJob::new(next_offset, items.len());
            next_offset = batch.end_offset();
            let span = info_span!(
                target: "threatline::coordinator",
                "batch",
                %run_id,
                batch_id = %batch.id,
                start_offset = batch.start_offset,
                size = batch.len()
            );

            let first = batch.start_offset;
            let reports: Vec<RecordReport> = futures::stream::iter(items.into_iter().zip(first..))
                .map(|(item, offset)| process(run_id, offset, item))
                .buffer_unordered(self.config.max_concurrency)
                .collect()
                .instrument(span)
                .await;

            for report in &reports {
                batch.settle(report);
                summary.record(report);
            }
            summary.batches += 1;

            let tally = batch.tally();
            if batch.is_complete() {
                summary.acknowledged_offset = batch.end_offset();
                debug!(
                    target: "threatline::coordinator",
                    %run_id,
                    batch_id = %batch.id,
                    succeeded = tally.succeeded,
                    failed = tally.failed,
                    retried = tally.retried,
                    "batch complete"
                );
            } else {
                // Cancellation stopped dispatch part-way; members that never
                // started are replayed from the acknowledged offset.
                summary.cancelled = true;
                warn!(
                    target: "threatline::coordinator",
                    %run_id,
                    batch_id = %batch.id,
                    succeeded = tally.succeeded,
                    failed = tally.failed,
                    acknowledged_offset = summary.acknowledged_offset,
                    "batch interrupted by cancellation"
                );
                break;
            }
        }

        info!(
            target: "threatline::coordinator",
            %run_id,
            mode,
            received = summary.received,
            ingested = summary.ingested,
            duplicates = summary.duplicates,
            validation_failed = summary.validation_failed,
            scored = summary.scored,
            failed = summary.failed,
            skipped = summary.skipped,
            stored_only = summary.stored_only,
            acknowledged_offset = summary.acknowledged_offset,
            cancelled = summary.cancelled,
            "run finished"
        );
        summary
    }

    async fn ingest_one(
        &self,
        run_id: Uuid,
        offset: u64,
        raw: Value,
        claims: &DashSet<RecordId>,
        cancel: &CancellationToken,
    ) -> RecordReport {
        if cancel.is_cancelled() {
            return RecordReport::not_dispatched(offset);
        }

        let record = match self.validator.validate(&raw) {
            Ok(record) => record,
            Err(err) => {
                debug!(
                    target: "threatline::coordinator",
                    offset,
                    field = %err.field,
                    reason = %err.reason,
                    "record rejected"
                );
                self.emit(
                    TelemetryEvent::new(run_id, TelemetryKind::ValidationFailed, Stage::Validate)
                        .with_offset(offset)
                        .with_detail(err.to_string()),
                );
                return RecordReport::settled(offset, None, RecordOutcome::ValidationFailed);
            }
        };
        let id = record.id.clone();

        let timeout = self.config.call_timeout();
        let write = call_with_retry(
            &self.backoff,
            timeout,
            "store write",
            || self.store.put_if_absent(StoredRecord::stored(record.clone())),
            |retry, err| {
                debug!(
                    target: "threatline::coordinator",
                    record_id = %id.short(),
                    retry,
                    error = %err,
                    "retrying store write"
                );
            },
        )
        .await;

        match write.result {
            Err(err) => {
                warn!(
                    target: "threatline::coordinator",
                    record_id = %id,
                    offset,
                    retries = write.retries,
                    error = %err,
                    "durable write failed"
                );
                self.emit(
                    TelemetryEvent::new(run_id, TelemetryKind::WriteFailed, Stage::Write)
                        .with_record(&id)
                        .with_offset(offset)
                        .with_detail(err.to_string()),
                );
                RecordReport::settled(offset, Some(id), RecordOutcome::Failed)
                    .with_retries(write.retries)
            }
            Ok(PutOutcome::AlreadyExists) if write.retries > 0 => {
                // An attempt that timed out or errored may still have landed.
                self.settle_retried_write(run_id, offset, &record, write.retries, claims)
                    .await
            }
            Ok(PutOutcome::AlreadyExists) => self.duplicate(run_id, offset, id),
            Ok(PutOutcome::Written) if !claims.insert(id.clone()) => {
                self.duplicate(run_id, offset, id).with_retries(write.retries)
            }
            Ok(PutOutcome::Written) => {
                self.emit(
                    TelemetryEvent::new(run_id, TelemetryKind::Ingested, Stage::Write)
                        .with_record(&id)
                        .with_offset(offset),
                );
                let (outcome, retries) = self.score(run_id, Some(offset), &record).await;
                RecordReport::settled(offset, Some(id), outcome)
                    .ingested()
                    .with_retries(write.retries + retries)
            }
        }
    }

    /// A retried write reported the identifier as present. When the stored
    /// copy is still STORED and no other item of this run has claimed it, the
    /// earlier attempt is taken to be ours and the record is scored.
    async fn settle_retried_write(
        &self,
        run_id: Uuid,
        offset: u64,
        record: &AttackRecord,
        write_retries: u32,
        claims: &DashSet<RecordId>,
    ) -> RecordReport {
        let id = &record.id;
        let read = call_with_retry(
            &self.backoff,
            self.config.call_timeout(),
            "store read",
            || self.store.get(id),
            |_, _| {},
        )
        .await;
        let retries = write_retries + read.retries;

        match read.result {
            Ok(Some(stored))
                if stored.status() == RecordStatus::Stored && claims.insert(id.clone()) =>
            {
                debug!(
                    target: "threatline::coordinator",
                    record_id = %id.short(),
                    offset,
                    "write acknowledged after retry"
                );
                self.emit(
                    TelemetryEvent::new(run_id, TelemetryKind::Ingested, Stage::Write)
                        .with_record(id)
                        .with_offset(offset)
                        .with_detail("write acknowledged after retry"),
                );
                let (outcome, inference_retries) = self.score(run_id, Some(offset), record).await;
                RecordReport::settled(offset, Some(id.clone()), outcome)
                    .ingested()
                    .with_retries(retries + inference_retries)
            }
            Ok(_) => self.duplicate(run_id, offset, id.clone()).with_retries(retries),
            Err(err) => {
                warn!(
                    target: "threatline::coordinator",
                    record_id = %id,
                    offset,
                    error = %err,
                    "could not read back a retried write; leaving it stored"
                );
                RecordReport::settled(offset, Some(id.clone()), RecordOutcome::StoredOnly)
                    .with_retries(retries)
            }
        }
    }

    fn duplicate(&self, run_id: Uuid, offset: u64, id: RecordId) -> RecordReport {
        self.emit(
            TelemetryEvent::new(run_id, TelemetryKind::DuplicateSkipped, Stage::Write)
                .with_record(&id)
                .with_offset(offset),
        );
        RecordReport::settled(offset, Some(id), RecordOutcome::Duplicate)
    }

    async fn resume_one(
        &self,
        run_id: Uuid,
        offset: u64,
        id: RecordId,
        cancel: &CancellationToken,
    ) -> RecordReport {
        if cancel.is_cancelled() {
            return RecordReport::not_dispatched(offset);
        }

        let timeout = self.config.call_timeout();
        let read = call_with_retry(
            &self.backoff,
            timeout,
            "store read",
            || self.store.get(&id),
            |_, _| {},
        )
        .await;

        let stored = match read.result {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!(
                    target: "threatline::coordinator",
                    record_id = %id,
                    "resume: record not found"
                );
                return RecordReport::settled(offset, Some(id), RecordOutcome::Failed);
            }
            Err(err) => {
                warn!(
                    target: "threatline::coordinator",
                    record_id = %id,
                    error = %err,
                    "resume: store read failed"
                );
                return RecordReport::settled(offset, Some(id), RecordOutcome::StoredOnly)
                    .with_retries(read.retries);
            }
        };

        if stored.status().is_terminal() {
            self.emit(
                TelemetryEvent::new(run_id, TelemetryKind::DuplicateSkipped, Stage::Reconcile)
                    .with_record(&id)
                    .with_detail(format!("already {}", stored.status())),
            );
            return RecordReport::settled(offset, Some(id), RecordOutcome::Duplicate);
        }

        let (outcome, retries) = self.score(run_id, None, &stored.record).await;
        RecordReport::settled(offset, Some(id), outcome).with_retries(read.retries + retries)
    }

    /// Infers and reconciles one durably written record. Returns the outcome
    /// and the number of inference retries spent.
    async fn score(
        &self,
        run_id: Uuid,
        offset: Option<u64>,
        record: &AttackRecord,
    ) -> (RecordOutcome, u32) {
        let id = &record.id;
        let event = |kind: TelemetryKind, stage: Stage| {
            let event = TelemetryEvent::new(run_id, kind, stage).with_record(id);
            match offset {
                Some(offset) => event.with_offset(offset),
                None => event,
            }
        };

        let Some(inference) = &self.inference else {
            self.emit(
                event(TelemetryKind::InferenceSkipped, Stage::Infer)
                    .with_detail("inference disabled"),
            );
            return (RecordOutcome::Skipped, 0);
        };

        if let Err(err) = self.reconciler.begin_scoring(id).await {
            warn!(
                target: "threatline::coordinator",
                record_id = %id,
                error = %err,
                "could not move record to SCORING; leaving it stored"
            );
            self.emit(
                event(TelemetryKind::InferenceFailed, Stage::Reconcile)
                    .with_detail(err.to_string()),
            );
            return (RecordOutcome::StoredOnly, 0);
        }

        let timeout = self.config.call_timeout();
        let (verdict, retries) = match self.config.features.extract(record) {
            Err(err) => (Verdict::failed(err.to_string()), 0),
            Ok(features) => {
                let attempted = call_with_retry(
                    &self.backoff,
                    timeout,
                    "inference",
                    || inference.predict(&features, timeout),
                    |retry, err| {
                        self.emit(
                            event(TelemetryKind::InferenceRetry, Stage::Infer)
                                .with_attempt(retry)
                                .with_detail(err.to_string()),
                        );
                    },
                )
                .await;
                let verdict = attempted
                    .result
                    .and_then(|score| {
                        InferenceResult::new(score, inference.model_version())
                            .map_err(|e| AdapterError::permanent(e.to_string()))
                    })
                    .map_or_else(|err| Verdict::failed(err.to_string()), Verdict::Scored);
                (verdict, attempted.retries)
            }
        };

        match self.reconciler.apply(id, verdict.clone()).await {
            Ok(ReconcileOutcome::Applied | ReconcileOutcome::AlreadyApplied) => match verdict {
                Verdict::Scored(result) => {
                    self.emit(
                        event(TelemetryKind::Scored, Stage::Reconcile)
                            .with_detail(format!(
                                "score={} model={}",
                                result.score, result.model_version
                            )),
                    );
                    (RecordOutcome::Scored, retries)
                }
                Verdict::Failed { reason } => {
                    self.emit(
                        event(TelemetryKind::InferenceFailed, Stage::Infer).with_detail(reason),
                    );
                    (RecordOutcome::Failed, retries)
                }
            },
            Ok(ReconcileOutcome::Superseded(kept)) => {
                // Another writer settled the record first; report the state
                // that was kept.
                if kept == RecordStatus::Scored {
                    self.emit(
                        event(TelemetryKind::Scored, Stage::Reconcile)
                            .with_detail("superseded: already scored"),
                    );
                    (RecordOutcome::Scored, retries)
                } else {
                    self.emit(
                        event(TelemetryKind::InferenceFailed, Stage::Reconcile)
                            .with_detail("superseded: already failed"),
                    );
                    (RecordOutcome::Failed, retries)
                }
            }
            Err(err) => {
                warn!(
                    target: "threatline::coordinator",
                    record_id = %id,
                    error = %err,
                    "reconcile failed; record left in SCORING"
                );
                self.emit(
                    event(TelemetryKind::InferenceFailed, Stage::Reconcile)
                        .with_detail(err.to_string()),
                );
                (RecordOutcome::StoredOnly, retries)
            }
        }
    }

    fn emit(&self, event: TelemetryEvent) {
        self.telemetry.emit(event);
    }
}
