//! Error types for keypoint operations

use thiserror::Error;

use crate::identity::RecordId;

/// Storage backend errors.
///
/// Reads that fail degrade to a cache miss and writes are logged and
/// dropped, so these never reach an HTTP caller directly.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Insert failed: {reason}")]
    InsertFailed { reason: String },

    #[error("Query failed: {reason}")]
    QueryFailed { reason: String },

    #[error("Record {id} is corrupt: {reason}")]
    CorruptRecord { id: RecordId, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Errors raised by the shared detector.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DetectorError {
    /// Construction or warmup failed. Every caller waiting on the same
    /// initialization attempt receives this.
    #[error("Detector initialization failed: {reason}")]
    Initialization { reason: String },

    /// The detector rejected or failed on a specific input.
    #[error("Detector processing failed: {reason}")]
    Processing { reason: String },
}

impl DetectorError {
    pub fn initialization(reason: impl Into<String>) -> Self {
        Self::Initialization {
            reason: reason.into(),
        }
    }

    pub fn processing(reason: impl Into<String>) -> Self {
        Self::Processing {
            reason: reason.into(),
        }
    }
}

/// Reading or fingerprinting a request body failed.
///
/// Fingerprinting failures are recovered locally. A body over the upload
/// limit is rejected with 413.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("Failed to read body: {reason}")]
    Body { reason: String },

    #[error("Malformed multipart payload: {reason}")]
    Multipart { reason: String },

    #[error("Body of at least {size} bytes exceeds the limit of {limit} bytes")]
    TooLarge { size: u64, limit: usize },
}

/// Fingerprint parsing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Fingerprint must be {expected} hex characters, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Fingerprint {value:?} contains non-lowercase-hex characters")]
    InvalidCharacters { value: String },
}
