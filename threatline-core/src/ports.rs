//! Seams to external collaborators. Vendor clients live behind these traits;
//! the coordinator and reconciler only ever see `dyn RecordStore` and
//! `dyn InferenceAdapter`.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::features::FeatureVector;
use crate::record::{RecordId, StoredRecord};

/// Result of [`RecordStore::put_if_absent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// This call created the record.
    Written,
    /// A record with the same identifier was already present; nothing changed.
    AlreadyExists,
}

/// Result of [`RecordStore::update_if_version`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The write landed.
    Applied {
        /// New compare-and-set token.
        version: u64,
    },
    /// The stored version no longer matched; nothing changed.
    Conflict,
    /// No record with that identifier exists.
    NotFound,
}

/// Durable key/value persistence with conditional-write semantics.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Writes `record` only if no record with the same identifier exists.
    /// Racing writers of one identifier: exactly one observes `Written`.
    async fn put_if_absent(&self, record: StoredRecord) -> Result<PutOutcome, AdapterError>;

    /// Replaces the record stored under `record.id()` if its version still
    /// equals `expected_version`. The store assigns the new version.
    async fn update_if_version(
        &self,
        expected_version: u64,
        record: StoredRecord,
    ) -> Result<UpdateOutcome, AdapterError>;

    /// Reads the current copy of a record, if any.
    async fn get(&self, id: &RecordId) -> Result<Option<StoredRecord>, AdapterError>;

    /// Cheap liveness check used by `threatlinectl check`.
    async fn health_check(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Model-serving boundary: one feature vector in, one score out.
#[async_trait]
pub trait InferenceAdapter: Send + Sync {
    /// Identifier recorded alongside every score this adapter produces.
    fn model_version(&self) -> &str;

    /// Scores `features`. Implementations must give up after `timeout` and
    /// classify the failure as transient.
    async fn predict(
        &self,
        features: &FeatureVector,
        timeout: Duration,
    ) -> Result<f64, AdapterError>;
}
