//! Keypoint API - Content-Addressed Result Cache over HTTP
//!
//! Serves `POST /process-image`: an uploaded image is fingerprinted by its
//! bytes, and a result previously computed for the same bytes is returned
//! from the record store instead of running the detector again. Every
//! exchange is intercepted and appended to an audit log off the request
//! path, without changing what the caller sees.
//!
//! The detector is initialized lazily on first use and shared by all
//! requests; `GET /check-status` reports whether it is ready.

pub mod config;
pub mod constants;
pub mod db;
pub mod detector;
pub mod error;
pub mod guard;
pub mod jobs;
pub mod macros;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use config::{ApiConfig, StoreBackend};
pub use db::{DbConfig, PgResultStore};
pub use detector::{FormatProbeDetector, FormatProbeFactory, ImageFormat, ProbeReport};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use guard::DetectorGuard;
pub use jobs::{AuditEntry, AuditSink, AuditSinkConfig, AuditSinkSnapshot, AuditWorker};
pub use routes::create_api_router;
pub use services::{CacheStatus, ImageProcessingService, ProcessedUpload};
pub use state::{connect_store, AppState};
