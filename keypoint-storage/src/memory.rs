//! In-memory result store.
//!
//! Keeps records in a vector in insertion order. Used for development
//! (`KEYPOINT_STORE=memory`) and tests.

use std::sync::RwLock;

use ::async_trait::async_trait;
use chrono::Utc;
use keypoint_core::{AuditRecord, Fingerprint, NewAuditRecord, RecordId, StorageError};

use crate::store::ResultStore;

/// Append-only in-memory store.
#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryResultStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self
            .records
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of every record in insertion order.
    pub fn records(&self) -> Result<Vec<AuditRecord>, StorageError> {
        Ok(self
            .records
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .clone())
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn append(&self, record: NewAuditRecord) -> Result<AuditRecord, StorageError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let id = records.len() as RecordId + 1;
        let stored = record.into_record(id, Utc::now());
        records.push(stored.clone());
        Ok(stored)
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<AuditRecord>, StorageError> {
        let records = self
            .records
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(records
            .iter()
            .find(|r| r.fingerprint.as_ref() == Some(fingerprint))
            .cloned())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        self.records
            .read()
            .map(|_| ())
            .map_err(|_| StorageError::LockPoisoned)
    }
}
