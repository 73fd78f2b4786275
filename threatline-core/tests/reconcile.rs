mod support;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;

use support::{ConflictingStore, Harness, ScriptedInference, attack, fast_config};
use threatline_core::adapters::InMemoryRecordStore;
use threatline_core::telemetry::TelemetryKind;
use threatline_core::{
    AdapterError, FeatureVector, InferenceAdapter, InferenceResult, PipelineError,
    ReconcileOutcome, Reconciler, RecordId, RecordStatus, RecordStore, RecordValidator,
    StoredRecord, Verdict,
};

async fn seed(store: &dyn RecordStore, n: u64) -> RecordId {
    let record = RecordValidator::default().validate(&attack(n)).unwrap();
    let id = record.id.clone();
    store.put_if_absent(StoredRecord::stored(record)).await.unwrap();
    id
}

#[tokio::test]
async fn single_conflict_is_absorbed_by_one_reread() {
    let store = Arc::new(ConflictingStore::new(0));
    let id = seed(store.as_ref(), 1).await;
    let reconciler = Reconciler::new(store.clone(), Duration::from_secs(1));

    store.arm(1);
    assert_eq!(
        reconciler.begin_scoring(&id).await.unwrap(),
        ReconcileOutcome::Applied
    );

    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status(), RecordStatus::Scoring);
    // Foreign bump plus our own write.
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn persistent_conflict_surfaces_after_one_retry() {
    let store = Arc::new(ConflictingStore::new(0));
    let id = seed(store.as_ref(), 1).await;
    let reconciler = Reconciler::new(store.clone(), Duration::from_secs(1));
    reconciler.begin_scoring(&id).await.unwrap();

    store.arm(2);
    let result = InferenceResult::new(0.9, "m").unwrap();
    let err = reconciler
        .apply(&id, Verdict::Scored(result))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ReconcileConflict(ref conflicted) if conflicted == &id));
    assert_eq!(store.get(&id).await.unwrap().unwrap().status(), RecordStatus::Scoring);
}

#[tokio::test]
async fn unresolved_conflict_leaves_record_stored_only() {
    let store = Arc::new(ConflictingStore::new(u32::MAX));
    let harness = Harness::new(
        fast_config(0),
        store.clone(),
        Arc::new(ScriptedInference::always(0.5)),
    );

    let summary = harness.run(vec![attack(1), attack(2)]).await;

    assert_eq!(summary.ingested, 2);
    assert_eq!(summary.stored_only, 2);
    assert_eq!(summary.scored, 0);
    assert!(summary.is_balanced());
    assert_eq!(harness.sink.count(TelemetryKind::InferenceFailed), 2);
}

#[tokio::test]
async fn resume_finishes_interrupted_records() {
    let store = Arc::new(InMemoryRecordStore::new());
    let reconciler = Reconciler::new(store.clone(), Duration::from_secs(1));

    // Crashed before inference: left in STORED.
    let stored = seed(store.as_ref(), 1).await;
    // Crashed mid-inference: left in SCORING.
    let scoring = seed(store.as_ref(), 2).await;
    reconciler.begin_scoring(&scoring).await.unwrap();
    // Already finished.
    let done = seed(store.as_ref(), 3).await;
    reconciler.begin_scoring(&done).await.unwrap();
    reconciler
        .apply(&done, Verdict::Scored(InferenceResult::new(0.1, "old").unwrap()))
        .await
        .unwrap();
    let missing: RecordId = "f".repeat(64).parse().unwrap();

    let harness = Harness::new(
        fast_config(0),
        store.clone(),
        Arc::new(ScriptedInference::always(0.65)),
    );
    let summary = harness
        .coordinator
        .resume(
            stream::iter(vec![stored.clone(), scoring.clone(), done.clone(), missing]),
            &CancellationToken::new(),
        )
        .await;
    harness.telemetry.shutdown().await;

    assert_eq!(summary.received, 4);
    assert_eq!(summary.scored, 2);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.ingested, 0);
    assert!(summary.is_balanced());

    for id in [&stored, &scoring] {
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status(), RecordStatus::Scored);
        assert_eq!(record.result.unwrap().score, 0.65);
    }
    let untouched = store.get(&done).await.unwrap().unwrap();
    assert_eq!(untouched.result.unwrap().model_version, "old");
}

/// Inference adapter that lets a competing writer settle the record while the
/// call is still in flight.
struct RacingInference {
    reconciler: Reconciler,
    id: RecordId,
}

#[async_trait]
impl InferenceAdapter for RacingInference {
    fn model_version(&self) -> &str {
        support::MODEL_VERSION
    }

    async fn predict(
        &self,
        _features: &FeatureVector,
        _timeout: Duration,
    ) -> Result<f64, AdapterError> {
        let first = InferenceResult::new(0.3, "racer")
            .map_err(|e| AdapterError::permanent(e.to_string()))?;
        self.reconciler
            .apply(&self.id, Verdict::Scored(first))
            .await
            .map_err(|e| AdapterError::permanent(e.to_string()))?;
        Ok(0.7)
    }
}

#[tokio::test]
async fn superseded_result_is_still_reported() {
    let store = Arc::new(InMemoryRecordStore::new());
    let id = RecordValidator::default().validate(&attack(1)).unwrap().id;
    let inference = Arc::new(RacingInference {
        reconciler: Reconciler::new(store.clone(), Duration::from_secs(1)),
        id: id.clone(),
    });
    let harness = Harness::new(fast_config(0), store.clone(), inference);

    let summary = harness.run(vec![attack(1)]).await;

    assert_eq!(summary.scored, 1);
    assert!(summary.is_balanced());

    let scored = harness.sink.of_kind(TelemetryKind::Scored);
    assert_eq!(scored.len(), 1);
    assert_eq!(scored[0].record_id.as_ref(), Some(&id));
    assert!(scored[0].detail.as_deref().unwrap().contains("superseded"));

    let kept = store.get(&id).await.unwrap().unwrap();
    assert_eq!(kept.status(), RecordStatus::Scored);
    assert_eq!(kept.result.unwrap().model_version, "racer");
}
