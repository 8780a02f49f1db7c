//! Middleware modules for the Keypoint API
//!
//! - `audit`: request/response interception feeding the audit sink
//! - `multipart`: multipart form reading shared by the audit layer and the
//!   upload handler
//!
//! # Middleware Order
//!
//! The body limit must sit outside the audit layer so the buffered request
//! it replays carries the same limit:
//!
//! ```ignore
//! Router::new()
//!     .route("/process-image", post(handler))
//!     // Innermost
//!     .layer(middleware::from_fn_with_state(audit_state, audit_middleware))
//!     .layer(DefaultBodyLimit::max(limit))
//!     // Outermost
//! ```

pub mod audit;
pub mod multipart;

pub use audit::{
    audit_middleware, capture_response, AuditLayerState, CapturedBody, ResultFingerprint,
};
pub use multipart::{fingerprint_first_file, is_multipart, next_form_field, FileField, FormField, TextField};
