//! Async result store trait.
//!
//! Append-only: records are inserted and looked up, never updated or
//! deleted. Each insert is a single independent write.

use std::sync::Arc;

use ::async_trait::async_trait;
use keypoint_core::{AuditRecord, Fingerprint, NewAuditRecord, StorageError};

/// Storage backend for audit records.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Append a record, returning it with its assigned id and timestamp.
    async fn append(&self, record: NewAuditRecord) -> Result<AuditRecord, StorageError>;

    /// Return the first record carrying `fingerprint` in the backend's
    /// natural order (insertion order). Duplicates are not deduplicated.
    async fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<AuditRecord>, StorageError>;

    /// Check if the storage backend is reachable.
    async fn health_check(&self) -> Result<(), StorageError>;
}

/// Store handle shared across request handlers and the audit sink.
pub type SharedResultStore = Arc<dyn ResultStore>;
