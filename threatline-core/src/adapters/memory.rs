//! Process-local record store.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::AdapterError;
use crate::ports::{PutOutcome, RecordStore, UpdateOutcome};
use crate::record::{RecordId, StoredRecord};

/// Process-local store used for dry runs and tests. Each identifier's entry
/// is guarded by its shard lock, which gives the same put-if-absent and
/// compare-and-set guarantees as the durable backends.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: DashMap<RecordId, StoredRecord>,
}

impl InMemoryRecordStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of every stored record, in no particular order.
    pub fn snapshot(&self) -> Vec<StoredRecord> {
        self.records.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn put_if_absent(&self, record: StoredRecord) -> Result<PutOutcome, AdapterError> {
        match self.records.entry(record.id().clone()) {
            Entry::Occupied(_) => Ok(PutOutcome::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(PutOutcome::Written)
            }
        }
    }

    async fn update_if_version(
        &self,
        expected_version: u64,
        mut record: StoredRecord,
    ) -> Result<UpdateOutcome, AdapterError> {
        let Some(mut current) = self.records.get_mut(record.id()) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if current.version != expected_version {
            return Ok(UpdateOutcome::Conflict);
        }
        let version = expected_version + 1;
        record.version = version;
        record.updated_at = Utc::now();
        *current = record;
        Ok(UpdateOutcome::Applied { version })
    }

    async fn get(&self, id: &RecordId) -> Result<Option<StoredRecord>, AdapterError> {
        Ok(self.records.get(id).map(|entry| entry.value().clone()))
    }
}
