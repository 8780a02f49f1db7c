//! Constants for the Keypoint API
//!
//! This module contains all constant values used throughout the API.

// ============================================================================
// SERVER
// ============================================================================

/// Default listen port
pub const DEFAULT_PORT: u16 = 8000;

/// Default CORS max age in seconds (24 hours)
pub const DEFAULT_CORS_MAX_AGE_SECS: u64 = 86400;

// ============================================================================
// BODY LIMITS
// ============================================================================

/// Default request body limit (25 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Default response capture limit (10 MiB)
pub const DEFAULT_MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;

// ============================================================================
// ROUTES
// ============================================================================

pub const PROCESS_IMAGE_PATH: &str = "/process-image";
pub const CHECK_STATUS_PATH: &str = "/check-status";

/// Multipart field that carries the upload on `/process-image`
pub const UPLOAD_FIELD: &str = "file";

/// Response header reporting whether `/process-image` was served from
/// stored results
pub const CACHE_STATUS_HEADER: &str = "x-keypoint-cache";

// ============================================================================
// AUDIT CAPTURE
// ============================================================================

/// Stored in place of a response body that is not valid UTF-8.
pub fn binary_placeholder(len: usize) -> String {
    format!("<binary data: {} bytes>", len)
}

/// Stored when the response body could not be read.
pub const EXTRACTION_ERROR_PLACEHOLDER: &str = "<error extracting response>";

// ============================================================================
// AUDIT SINK
// ============================================================================

/// Default capacity of the audit queue
pub const DEFAULT_AUDIT_QUEUE_CAPACITY: usize = 1024;

/// Default number of concurrent audit writes
pub const DEFAULT_AUDIT_MAX_IN_FLIGHT: usize = 8;

/// Default time allowed to drain the audit queue at shutdown (seconds)
pub const DEFAULT_AUDIT_SHUTDOWN_SECS: u64 = 10;

// ============================================================================
// STAGED UPLOADS
// ============================================================================

pub const UPLOAD_TEMP_PREFIX: &str = "keypoint-upload-";

/// Longest file extension carried onto a staged upload
pub const MAX_UPLOAD_SUFFIX_LEN: usize = 16;
