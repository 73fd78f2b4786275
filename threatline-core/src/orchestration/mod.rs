//! Batch coordination, retry policy, and reconciliation.

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod reconciler;
pub mod retry;
pub mod summary;

pub use batch::{BatchId, BatchJob, BatchMember, BatchTally, RecordOutcome};
pub use config::{PipelineConfig, RetryConfig, TelemetryConfig};
pub use coordinator::BatchCoordinator;
pub use reconciler::{ReconcileOutcome, Reconciler, Verdict};
pub use retry::BackoffPolicy;
pub use summary::IngestSummary;
