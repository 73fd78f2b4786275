#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use threatline_core::adapters::InMemoryRecordStore;
use threatline_core::telemetry::{
    TelemetryEmitter, TelemetryError, TelemetryEvent, TelemetryKind, TelemetrySink,
};
use threatline_core::{
    AdapterError, BatchCoordinator, FeatureVector, IngestSummary, InferenceAdapter, PipelineConfig,
    PutOutcome, RecordId, RecordStore, RetryConfig, StoredRecord, UpdateOutcome,
};

pub const MODEL_VERSION: &str = "test-model-1";

/// Telemetry sink that keeps every event for later assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: TelemetryKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub fn of_kind(&self, kind: TelemetryKind) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TelemetrySink for RecordingSink {
    async fn accept(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        self.events.lock().push(event);
        Ok(())
    }
}

type Script = dyn Fn(&FeatureVector, u32) -> Result<f64, AdapterError> + Send + Sync;

/// Inference adapter whose answer is computed from the feature vector and the
/// zero-based call number.
pub struct ScriptedInference {
    script: Box<Script>,
    calls: AtomicU32,
    delay: Option<Duration>,
}

impl ScriptedInference {
    pub fn new(
        script: impl Fn(&FeatureVector, u32) -> Result<f64, AdapterError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: AtomicU32::new(0),
            delay: None,
        }
    }

    pub fn always(score: f64) -> Self {
        Self::new(move |_, _| Ok(score))
    }

    pub fn always_transient() -> Self {
        Self::new(|_, _| Err(AdapterError::transient("model endpoint unavailable")))
    }

    /// Fails transiently for the first `failures` calls, then succeeds.
    pub fn flaky(failures: u32, score: f64) -> Self {
        Self::new(move |_, call| {
            if call < failures {
                Err(AdapterError::transient(format!("flake #{call}")))
            } else {
                Ok(score)
            }
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceAdapter for ScriptedInference {
    fn model_version(&self) -> &str {
        MODEL_VERSION
    }

    async fn predict(
        &self,
        features: &FeatureVector,
        _timeout: Duration,
    ) -> Result<f64, AdapterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(features, call)
    }
}

/// Inference adapter that holds each call for `hold` and records the highest
/// number of calls in flight at once.
pub struct GaugedInference {
    hold: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicU32,
}

impl GaugedInference {
    pub fn new(hold: Duration) -> Self {
        Self {
            hold,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceAdapter for GaugedInference {
    fn model_version(&self) -> &str {
        MODEL_VERSION
    }

    async fn predict(
        &self,
        _features: &FeatureVector,
        _timeout: Duration,
    ) -> Result<f64, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(0.5)
    }
}

/// Inference adapter that trips a cancellation token on its first call.
pub struct CancellingInference {
    pub token: CancellationToken,
    calls: AtomicU32,
}

impl CancellingInference {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceAdapter for CancellingInference {
    fn model_version(&self) -> &str {
        MODEL_VERSION
    }

    async fn predict(
        &self,
        _features: &FeatureVector,
        _timeout: Duration,
    ) -> Result<f64, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
        Ok(0.5)
    }
}

/// Store that lets a foreign writer bump the version right before each of
/// the next `conflicts` conditional updates, forcing a CAS conflict.
pub struct ConflictingStore {
    pub inner: InMemoryRecordStore,
    conflicts: AtomicU32,
}

impl ConflictingStore {
    pub fn new(conflicts: u32) -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            conflicts: AtomicU32::new(conflicts),
        }
    }

    pub fn arm(&self, conflicts: u32) {
        self.conflicts.store(conflicts, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for ConflictingStore {
    async fn put_if_absent(&self, record: StoredRecord) -> Result<PutOutcome, AdapterError> {
        self.inner.put_if_absent(record).await
    }

    async fn update_if_version(
        &self,
        expected_version: u64,
        record: StoredRecord,
    ) -> Result<UpdateOutcome, AdapterError> {
        let inject = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if inject && let Some(current) = self.inner.get(record.id()).await? {
            let version = current.version;
            self.inner.update_if_version(version, current).await?;
        }
        self.inner.update_if_version(expected_version, record).await
    }

    async fn get(&self, id: &RecordId) -> Result<Option<StoredRecord>, AdapterError> {
        self.inner.get(id).await
    }
}

/// Store whose first `failures` writes fail with `error`.
pub struct FlakyStore {
    pub inner: InMemoryRecordStore,
    failures: AtomicU32,
    error: AdapterError,
}

impl FlakyStore {
    pub fn new(failures: u32, error: AdapterError) -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            failures: AtomicU32::new(failures),
            error,
        }
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn put_if_absent(&self, record: StoredRecord) -> Result<PutOutcome, AdapterError> {
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(self.error.clone());
        }
        self.inner.put_if_absent(record).await
    }

    async fn update_if_version(
        &self,
        expected_version: u64,
        record: StoredRecord,
    ) -> Result<UpdateOutcome, AdapterError> {
        self.inner.update_if_version(expected_version, record).await
    }

    async fn get(&self, id: &RecordId) -> Result<Option<StoredRecord>, AdapterError> {
        self.inner.get(id).await
    }
}

/// Store whose first `stalls` writes land and then hang for `stall`, so the
/// caller times out on a write that actually succeeded.
pub struct LateAckStore {
    pub inner: InMemoryRecordStore,
    stalls: AtomicU32,
    stall: Duration,
}

impl LateAckStore {
    pub fn new(stalls: u32, stall: Duration) -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            stalls: AtomicU32::new(stalls),
            stall,
        }
    }
}

#[async_trait]
impl RecordStore for LateAckStore {
    async fn put_if_absent(&self, record: StoredRecord) -> Result<PutOutcome, AdapterError> {
        let stall = self
            .stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let outcome = self.inner.put_if_absent(record).await?;
        if stall {
            tokio::time::sleep(self.stall).await;
        }
        Ok(outcome)
    }

    async fn update_if_version(
        &self,
        expected_version: u64,
        record: StoredRecord,
    ) -> Result<UpdateOutcome, AdapterError> {
        self.inner.update_if_version(expected_version, record).await
    }

    async fn get(&self, id: &RecordId) -> Result<Option<StoredRecord>, AdapterError> {
        self.inner.get(id).await
    }
}

/// A complete raw record; `n` varies the content (and therefore the id).
pub fn attack(n: u64) -> Value {
    json!({
        "source_ip": format!("192.0.2.{}", n % 250 + 1),
        "destination_ip": "198.51.100.7",
        "timestamp": 1_700_000_000 + n,
        "category": "brute_force",
        "protocol": "tcp",
        "payload_size": n,
        "dst_port": 22
    })
}

pub fn fast_config(max_retries: u32) -> PipelineConfig {
    PipelineConfig {
        batch_size: 4,
        max_concurrency: 3,
        retry: RetryConfig {
            max_retries,
            backoff_base_ms: 10,
            backoff_cap_ms: 80,
        },
        call_timeout_ms: 1_000,
        ..PipelineConfig::default()
    }
}

pub struct Harness {
    pub coordinator: BatchCoordinator,
    pub telemetry: TelemetryEmitter,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn RecordStore>,
        inference: Arc<dyn InferenceAdapter>,
    ) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let telemetry = TelemetryEmitter::spawn(sink.clone(), 1_024);
        let coordinator = BatchCoordinator::new(config, store, inference, telemetry.clone())
            .expect("valid test config");
        Self {
            coordinator,
            telemetry,
            sink,
        }
    }

    /// Harness whose coordinator writes records without scoring them.
    pub fn store_only(config: PipelineConfig, store: Arc<dyn RecordStore>) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let telemetry = TelemetryEmitter::spawn(sink.clone(), 1_024);
        let coordinator = BatchCoordinator::store_only(config, store, telemetry.clone())
            .expect("valid test config");
        Self {
            coordinator,
            telemetry,
            sink,
        }
    }

    /// Submits `records`, then flushes telemetry so the sink is complete.
    pub async fn run(&self, records: Vec<Value>) -> IngestSummary {
        self.run_with(records, &CancellationToken::new()).await
    }

    pub async fn run_with(&self, records: Vec<Value>, cancel: &CancellationToken) -> IngestSummary {
        let summary = self
            .coordinator
            .submit(futures::stream::iter(records), cancel)
            .await;
        self.telemetry.shutdown().await;
        summary
    }
}
