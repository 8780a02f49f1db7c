//! Keypoint Telemetry - Observability Infrastructure
//!
//! Provides structured logging and Prometheus metrics for the API layer.

pub mod metrics;
pub mod middleware;
pub mod subscriber;

pub use metrics::{metrics, metrics_handler, AuditOutcome, CacheOutcome, KeypointMetrics, METRICS};
pub use middleware::observability_middleware;
pub use subscriber::{init_tracing, LogFormat, TelemetryConfig};
