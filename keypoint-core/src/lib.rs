//! Keypoint Core - Domain Types
//!
//! Pure data structures and contracts shared by every other crate:
//! content fingerprints, audit records, the detector contract, and the
//! error taxonomy. No I/O lives here.

pub mod detector;
pub mod error;
pub mod identity;
pub mod record;

pub use detector::{DetectionResult, Detector, DetectorFactory, SharedDetector};
pub use error::{DetectorError, ExtractionError, FingerprintError, StorageError};
pub use identity::{Fingerprint, RecordId, Timestamp, FINGERPRINT_HEX_LEN};
pub use record::{parse_payload, AuditRecord, NewAuditRecord};
