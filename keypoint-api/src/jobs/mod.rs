//! Background Jobs for the Keypoint API
//!
//! - `audit_sink`: Persists audit records off the request path
//!
//! # Usage
//!
//! ```ignore
//! use keypoint_api::jobs::{AuditSink, AuditSinkConfig};
//!
//! let (sink, worker) = AuditSink::spawn(store, AuditSinkConfig::from_env());
//!
//! // Requests submit through clones of `sink`.
//!
//! // On shutdown, drain what is queued.
//! let snapshot = worker.shutdown().await;
//! ```

pub mod audit_sink;

// Re-export commonly used types
pub use audit_sink::{
    write_entry, AuditEntry, AuditSink, AuditSinkConfig, AuditSinkMetrics, AuditSinkSnapshot,
    AuditWorker,
};
