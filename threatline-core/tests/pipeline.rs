mod support;

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use support::{
    CancellingInference, FlakyStore, GaugedInference, Harness, LateAckStore, ScriptedInference,
    attack, fast_config,
};
use threatline_core::adapters::InMemoryRecordStore;
use threatline_core::telemetry::TelemetryKind;
use threatline_core::{
    AdapterError, BatchCoordinator, PipelineConfig, PipelineError, RecordStatus, RecordStore,
    RecordValidator,
};

#[tokio::test]
async fn identical_records_are_stored_once() {
    let store = Arc::new(InMemoryRecordStore::new());
    let harness = Harness::new(
        fast_config(3),
        store.clone(),
        Arc::new(ScriptedInference::always(0.9)),
    );

    let summary = harness.run(vec![attack(1), attack(1)]).await;

    assert_eq!(summary.received, 2);
    assert_eq!(summary.ingested, 1);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.scored, 1);
    assert_eq!(summary.failed, 0);
    assert!(summary.is_balanced());

    assert_eq!(store.len(), 1);
    assert_eq!(harness.sink.count(TelemetryKind::Ingested), 1);
    assert_eq!(harness.sink.count(TelemetryKind::DuplicateSkipped), 1);
}

#[tokio::test]
async fn reingesting_a_scored_record_leaves_it_untouched() {
    let store = Arc::new(InMemoryRecordStore::new());
    let first = Harness::new(
        fast_config(0),
        store.clone(),
        Arc::new(ScriptedInference::always(0.2)),
    );
    first.run(vec![attack(7)]).await;

    let second = Harness::new(
        fast_config(0),
        store.clone(),
        Arc::new(ScriptedInference::always(0.8)),
    );
    let summary = second.run(vec![attack(7)]).await;
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.ingested, 0);

    let id = RecordValidator::default().validate(&attack(7)).unwrap().id;
    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status(), RecordStatus::Scored);
    assert_eq!(stored.result.unwrap().score, 0.2);
}

#[tokio::test]
async fn field_order_does_not_create_a_second_record() {
    let store = Arc::new(InMemoryRecordStore::new());
    let harness = Harness::new(
        fast_config(0),
        store.clone(),
        Arc::new(ScriptedInference::always(0.5)),
    );

    let a: serde_json::Value = serde_json::from_str(
        r#"{"source_ip":"10.1.1.1","destination_ip":"10.1.1.2","timestamp":5,"category":"dos","extra":{"x":1,"y":2}}"#,
    )
    .unwrap();
    let b: serde_json::Value = serde_json::from_str(
        r#"{"extra":{"y":2,"x":1},"category":"DOS","timestamp":"5","destination_ip":"10.1.1.2","source_ip":"10.1.1.1"}"#,
    )
    .unwrap();

    let summary = harness.run(vec![a, b]).await;
    assert_eq!(summary.ingested, 1);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn every_input_is_accounted_for_exactly_once() {
    let store = Arc::new(InMemoryRecordStore::new());
    let harness = Harness::new(
        fast_config(0),
        store.clone(),
        Arc::new(ScriptedInference::new(|features, _| {
            if features.as_slice()[0] == 3.0 {
                Err(AdapterError::permanent("model rejected input"))
            } else {
                Ok(0.4)
            }
        })),
    );

    let records = vec![
        attack(1),
        attack(2),
        attack(2),
        json!({"source_ip": "10.0.0.1"}),
        json!("not an object"),
        attack(3),
        attack(4),
        attack(5),
        attack(6),
    ];
    let total = records.len() as u64;
    let summary = harness.run(records).await;

    assert_eq!(summary.received, total);
    assert!(summary.is_balanced());
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.validation_failed, 2);
    assert_eq!(summary.scored, 5);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.stored_only, 0);
    assert_eq!(summary.acknowledged_offset, total);
    assert_eq!(summary.batches, 3);
    assert!(!summary.cancelled);

    let offsets: Vec<_> = harness
        .sink
        .of_kind(TelemetryKind::ValidationFailed)
        .into_iter()
        .map(|e| e.offset)
        .collect();
    assert!(offsets.contains(&Some(3)));
    assert!(offsets.contains(&Some(4)));
}

#[tokio::test(start_paused = true)]
async fn always_transient_inference_exhausts_the_retry_budget() {
    let store = Arc::new(InMemoryRecordStore::new());
    let inference = Arc::new(ScriptedInference::always_transient());
    let harness = Harness::new(fast_config(3), store.clone(), inference.clone());

    let summary = harness.run(vec![attack(1)]).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retries, 3);
    assert_eq!(inference.calls(), 4);
    assert_eq!(harness.sink.count(TelemetryKind::InferenceRetry), 3);
    assert_eq!(harness.sink.count(TelemetryKind::InferenceFailed), 1);

    let id = RecordValidator::default().validate(&attack(1)).unwrap().id;
    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status(), RecordStatus::Failed);
    assert!(stored.failure.is_some());
}

#[tokio::test(start_paused = true)]
async fn two_transient_failures_then_success_is_scored() {
    let store = Arc::new(InMemoryRecordStore::new());
    let harness = Harness::new(
        fast_config(3),
        store.clone(),
        Arc::new(ScriptedInference::flaky(2, 0.75)),
    );

    let summary = harness.run(vec![attack(1)]).await;

    assert_eq!(summary.scored, 1);
    assert_eq!(summary.failed, 0);

    let retries = harness.sink.of_kind(TelemetryKind::InferenceRetry);
    assert_eq!(retries.len(), 2);
    assert_eq!(
        retries.iter().map(|e| e.attempt).collect::<Vec<_>>(),
        vec![Some(1), Some(2)]
    );

    let id = RecordValidator::default().validate(&attack(1)).unwrap().id;
    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status(), RecordStatus::Scored);
    let result = stored.result.unwrap();
    assert_eq!(result.score, 0.75);
    assert_eq!(result.model_version, support::MODEL_VERSION);
}

#[tokio::test]
async fn one_permanent_failure_does_not_affect_its_batch() {
    let store = Arc::new(InMemoryRecordStore::new());
    let harness = Harness::new(
        PipelineConfig {
            batch_size: 10,
            max_concurrency: 4,
            ..fast_config(3)
        },
        store.clone(),
        Arc::new(ScriptedInference::new(|features, _| {
            if features.as_slice()[0] == 5.0 {
                Err(AdapterError::permanent("unsupported feature shape"))
            } else {
                Ok(0.6)
            }
        })),
    );

    let summary = harness.run((0..10).map(attack).collect()).await;

    assert_eq!(summary.scored, 9);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retries, 0);
    let statuses: Vec<_> = store.snapshot().iter().map(|r| r.status()).collect();
    assert_eq!(statuses.iter().filter(|s| **s == RecordStatus::Scored).count(), 9);
    assert_eq!(statuses.iter().filter(|s| **s == RecordStatus::Failed).count(), 1);
}

#[tokio::test]
async fn malformed_features_fail_without_calling_the_model() {
    let store = Arc::new(InMemoryRecordStore::new());
    let inference = Arc::new(ScriptedInference::always(0.5));
    let harness = Harness::new(fast_config(3), store.clone(), inference.clone());

    let mut raw = attack(1);
    raw["payload_size"] = json!("huge");
    let summary = harness.run(vec![raw]).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(inference.calls(), 0);
    let failed = harness.sink.of_kind(TelemetryKind::InferenceFailed);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].detail.as_deref().unwrap().contains("payload_size"));
}

#[tokio::test]
async fn out_of_range_scores_are_permanent_failures() {
    let harness = Harness::new(
        fast_config(3),
        Arc::new(InMemoryRecordStore::new()),
        Arc::new(ScriptedInference::always(1.7)),
    );
    let summary = harness.run(vec![attack(1)]).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn slow_inference_times_out_and_is_retried() {
    let inference = Arc::new(ScriptedInference::always(0.3).with_delay(Duration::from_secs(5)));
    let harness = Harness::new(
        PipelineConfig {
            call_timeout_ms: 100,
            ..fast_config(2)
        },
        Arc::new(InMemoryRecordStore::new()),
        inference.clone(),
    );

    let summary = harness.run(vec![attack(1)]).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(inference.calls(), 3);
    let retries = harness.sink.of_kind(TelemetryKind::InferenceRetry);
    assert!(retries[0].detail.as_deref().unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn transient_store_failures_are_retried() {
    let store = Arc::new(FlakyStore::new(2, AdapterError::transient("connection reset")));
    let harness = Harness::new(
        fast_config(3),
        store.clone(),
        Arc::new(ScriptedInference::always(0.5)),
    );

    let summary = harness.run(vec![attack(1)]).await;
    assert_eq!(summary.scored, 1);
    assert_eq!(summary.ingested, 1);
    assert_eq!(summary.retries, 2);
}

#[tokio::test]
async fn permanent_store_failure_fails_the_record() {
    let store = Arc::new(FlakyStore::new(1, AdapterError::permanent("constraint violated")));
    let inference = Arc::new(ScriptedInference::always(0.5));
    let harness = Harness::new(fast_config(3), store.clone(), inference.clone());

    let summary = harness.run(vec![attack(1), attack(2)]).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.scored, 1);
    assert_eq!(summary.ingested, 1);
    assert!(summary.is_balanced());
    assert_eq!(harness.sink.count(TelemetryKind::WriteFailed), 1);
    assert_eq!(inference.calls(), 1);
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_holds_the_acknowledged_offset() {
    let cancel = CancellationToken::new();
    let inference = Arc::new(CancellingInference::new(cancel.clone()));
    let harness = Harness::new(
        PipelineConfig {
            batch_size: 2,
            max_concurrency: 1,
            ..fast_config(0)
        },
        Arc::new(InMemoryRecordStore::new()),
        inference.clone(),
    );

    let summary = harness.run_with((0..6).map(attack).collect(), &cancel).await;

    assert!(summary.cancelled);
    assert_eq!(inference.calls(), 1);
    // The in-flight record completed; its batch-mate never started.
    assert_eq!(summary.received, 1);
    assert_eq!(summary.scored, 1);
    assert_eq!(summary.acknowledged_offset, 0);
    assert!(summary.is_balanced());
}

#[tokio::test]
async fn restart_offset_is_carried_into_the_summary() {
    let harness = Harness::new(
        fast_config(0),
        Arc::new(InMemoryRecordStore::new()),
        Arc::new(ScriptedInference::always(0.5)),
    );

    let summary = harness
        .coordinator
        .submit_from(
            40,
            futures::stream::iter(vec![attack(1), json!(null)]),
            &CancellationToken::new(),
        )
        .await;
    harness.telemetry.shutdown().await;

    assert_eq!(summary.acknowledged_offset, 42);
    let rejected = harness.sink.of_kind(TelemetryKind::ValidationFailed);
    assert_eq!(rejected[0].offset, Some(41));
}

#[tokio::test]
async fn invalid_configuration_is_rejected_before_any_io() {
    let store = Arc::new(InMemoryRecordStore::new());
    let sink = Arc::new(support::RecordingSink::default());
    let telemetry = threatline_core::telemetry::TelemetryEmitter::spawn(sink, 8);

    let err = BatchCoordinator::new(
        PipelineConfig {
            batch_size: 0,
            ..PipelineConfig::default()
        },
        store.clone(),
        Arc::new(ScriptedInference::always(0.5)),
        telemetry,
    )
    .unwrap_err();

    assert!(matches!(err, PipelineError::Configuration(_)));
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn ready_records_are_dispatched_before_the_batch_fills() {
    let store = Arc::new(InMemoryRecordStore::new());
    let harness = Harness::new(
        PipelineConfig {
            batch_size: 10,
            ..fast_config(0)
        },
        store.clone(),
        Arc::new(ScriptedInference::always(0.4)),
    );
    let cancel = CancellationToken::new();
    // A live feed: three records arrive, then nothing more for now.
    let feed = stream::iter((1..=3).map(attack)).chain(stream::pending());

    let settled = async {
        loop {
            let scored = store
                .snapshot()
                .iter()
                .filter(|stored| stored.status() == RecordStatus::Scored)
                .count();
            if scored == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
    };
    let (summary, ()) = tokio::time::timeout(Duration::from_secs(3_600), async {
        tokio::join!(harness.coordinator.submit(feed, &cancel), settled)
    })
    .await
    .expect("records waited for a full batch");
    harness.telemetry.shutdown().await;

    assert_eq!(summary.received, 3);
    assert_eq!(summary.scored, 3);
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.acknowledged_offset, 3);
    assert!(summary.cancelled);
    assert!(summary.is_balanced());
}

#[tokio::test(start_paused = true)]
async fn write_that_lands_after_a_timeout_is_still_scored() {
    // The first write lands but is acknowledged only after the call timeout.
    let store = Arc::new(LateAckStore::new(1, Duration::from_secs(10)));
    let inference = Arc::new(ScriptedInference::always(0.5));
    let harness = Harness::new(fast_config(3), store.clone(), inference.clone());

    let summary = harness.run(vec![attack(1)]).await;

    assert_eq!(summary.received, 1);
    assert_eq!(summary.ingested, 1);
    assert_eq!(summary.duplicates, 0);
    assert_eq!(summary.scored, 1);
    assert_eq!(summary.retries, 1);
    assert!(summary.is_balanced());
    assert_eq!(inference.calls(), 1);

    let stored = store.inner.snapshot();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status(), RecordStatus::Scored);

    let ingested = harness.sink.of_kind(TelemetryKind::Ingested);
    assert_eq!(ingested.len(), 1);
    assert!(ingested[0].detail.as_deref().unwrap().contains("after retry"));
    assert_eq!(harness.sink.count(TelemetryKind::DuplicateSkipped), 0);
}

#[tokio::test(start_paused = true)]
async fn late_acknowledged_write_still_dedups_its_twin() {
    let store = Arc::new(LateAckStore::new(1, Duration::from_secs(10)));
    let inference = Arc::new(ScriptedInference::always(0.5));
    let harness = Harness::new(fast_config(3), store.clone(), inference.clone());

    let summary = harness.run(vec![attack(1), attack(1)]).await;

    assert_eq!(summary.received, 2);
    assert_eq!(summary.ingested, 1);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.scored, 1);
    assert!(summary.is_balanced());
    assert_eq!(inference.calls(), 1);
    assert_eq!(store.inner.len(), 1);
}

#[tokio::test]
async fn store_only_mode_skips_inference_and_leaves_records_stored() {
    let store = Arc::new(InMemoryRecordStore::new());
    let harness = Harness::store_only(fast_config(0), store.clone());

    let summary = harness
        .run(vec![attack(1), attack(2), attack(1), json!(null)])
        .await;

    assert_eq!(summary.received, 4);
    assert_eq!(summary.ingested, 2);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.validation_failed, 1);
    assert_eq!(summary.scored, 0);
    assert!(summary.is_balanced());
    assert!(!harness.coordinator.infers());
    assert_eq!(harness.sink.count(TelemetryKind::InferenceSkipped), 2);

    let stored = store.snapshot();
    assert!(stored.iter().all(|r| r.status() == RecordStatus::Stored));

    // A later run with inference attached picks the skipped records up.
    let scorer = Harness::new(
        fast_config(0),
        store.clone(),
        Arc::new(ScriptedInference::always(0.6)),
    );
    let ids: Vec<_> = stored.iter().map(|r| r.id().clone()).collect();
    let resumed = scorer
        .coordinator
        .resume(stream::iter(ids), &CancellationToken::new())
        .await;
    assert_eq!(resumed.scored, 2);
    assert!(store.snapshot().iter().all(|r| r.status() == RecordStatus::Scored));
}

#[tokio::test(start_paused = true)]
async fn in_flight_inference_calls_never_exceed_max_concurrency() {
    let inference = Arc::new(GaugedInference::new(Duration::from_millis(50)));
    let harness = Harness::new(
        PipelineConfig {
            batch_size: 8,
            max_concurrency: 3,
            ..fast_config(0)
        },
        Arc::new(InMemoryRecordStore::new()),
        inference.clone(),
    );

    let summary = harness.run((0..8).map(attack).collect()).await;

    assert_eq!(summary.scored, 8);
    assert_eq!(inference.calls(), 8);
    assert_eq!(inference.peak(), 3);
}
