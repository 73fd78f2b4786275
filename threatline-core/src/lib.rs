//! # Threatline Core
//!
//! Ingestion-and-inference orchestration for network-attack telemetry: raw
//! attack records are validated and canonicalized, written durably at most
//! once per content-derived identifier, scored by an external model with
//! bounded concurrency and retry, and reconciled back onto the stored
//! record. Every stage transition is reported as a telemetry event.
//!
//! ## Feature Flags
//!
//! - `postgres`: enables [`adapters::PostgresRecordStore`] (PostgreSQL via SQLx)
//!
//! ## Architecture
//!
//! - [`validation`]: pure normalization of raw mappings into [`AttackRecord`]s
//! - [`record`]: record model, persisted layout, identifier derivation
//! - [`features`]: feature vector extraction for the model
//! - [`ports`]: store and inference seams implemented by [`adapters`]
//! - [`orchestration`]: [`BatchCoordinator`], retry policy, [`Reconciler`]
//! - [`telemetry`]: non-blocking event emission and sinks
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use threatline_core::adapters::{HttpInferenceAdapter, HttpInferenceConfig, InMemoryRecordStore};
//! use threatline_core::telemetry::{TelemetryEmitter, TracingSink};
//! use threatline_core::{BatchCoordinator, PipelineConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run(records: Vec<serde_json::Value>) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default();
//!     let inference = HttpInferenceAdapter::new(HttpInferenceConfig::new(
//!         "http://127.0.0.1:8080/predict".parse()?,
//!         "model-2024-06",
//!     ))?;
//!     let capacity = config.telemetry.channel_capacity;
//!     let telemetry = TelemetryEmitter::spawn(Arc::new(TracingSink), capacity);
//!     let coordinator = BatchCoordinator::new(
//!         config,
//!         Arc::new(InMemoryRecordStore::new()),
//!         Arc::new(inference),
//!         telemetry.clone(),
//!     )?;
//!
//!     let summary = coordinator
//!         .submit(futures::stream::iter(records), &CancellationToken::new())
//!         .await;
//!     telemetry.shutdown().await;
//!     assert!(summary.is_balanced());
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod error;
pub mod features;
pub mod orchestration;
pub mod ports;
pub mod record;
pub mod telemetry;
pub mod validation;

pub use error::{AdapterError, PipelineError, Result, ValidationError};
pub use features::{FeatureError, FeatureSpec, FeatureVector};
pub use orchestration::{
    BatchCoordinator, IngestSummary, PipelineConfig, ReconcileOutcome, Reconciler, RetryConfig,
    Verdict,
};
pub use ports::{InferenceAdapter, PutOutcome, RecordStore, UpdateOutcome};
pub use record::{AttackRecord, InferenceResult, RecordId, RecordStatus, StoredRecord};
pub use validation::{RecordSchema, RecordValidator};
