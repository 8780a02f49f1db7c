//! Audit records
//!
//! Every request/response exchange leaves one immutable record behind. The
//! same records double as the result cache: a successful processing
//! response is stored with the upload's fingerprint and served back on the
//! next upload of identical content.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{Fingerprint, RecordId, Timestamp};

/// A persisted audit record. Created once, never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: RecordId,
    pub timestamp: Timestamp,
    /// Route the exchange was served on, e.g. `/process-image`.
    pub operation: String,
    /// Response payload: parsed JSON when the body was JSON, otherwise the
    /// raw text as a JSON string. `None` for empty bodies.
    pub payload: Option<Value>,
    pub fingerprint: Option<Fingerprint>,
}

/// A record that has not been assigned an id or timestamp yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditRecord {
    pub operation: String,
    pub payload: Option<Value>,
    pub fingerprint: Option<Fingerprint>,
}

impl NewAuditRecord {
    pub fn new(
        operation: impl Into<String>,
        payload: Option<Value>,
        fingerprint: Option<Fingerprint>,
    ) -> Self {
        Self {
            operation: operation.into(),
            payload,
            fingerprint,
        }
    }

    /// Build a record from captured response text, parsing it as JSON when
    /// possible.
    pub fn from_response_text(
        operation: impl Into<String>,
        response_text: &str,
        fingerprint: Option<Fingerprint>,
    ) -> Self {
        Self::new(operation, parse_payload(response_text), fingerprint)
    }

    /// Attach the backend-assigned id and timestamp.
    pub fn into_record(self, id: RecordId, timestamp: Timestamp) -> AuditRecord {
        AuditRecord {
            id,
            timestamp,
            operation: self.operation,
            payload: self.payload,
            fingerprint: self.fingerprint,
        }
    }
}

/// Parse a response body for storage.
///
/// Empty text yields `None`; valid JSON yields the parsed value; anything
/// else is kept verbatim as a JSON string.
pub fn parse_payload(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}
