//! Prometheus Metrics Definitions
//!
//! Defines all Keypoint metrics with appropriate labels and types.
//! Exposes a /metrics endpoint for Prometheus scraping.

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s, 30s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<KeypointMetrics>> = Lazy::new(KeypointMetrics::new);

/// Registered metrics, or `None` if registration failed.
pub fn metrics() -> Option<&'static KeypointMetrics> {
    METRICS.as_ref().ok()
}

/// Outcome label for a result-store lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// The lookup failed and was treated as a miss.
    Error,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Error => "error",
        }
    }
}

/// Outcome label for an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Written,
    Failed,
    /// Rejected because the audit queue was full or closed.
    Dropped,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Written => "written",
            AuditOutcome::Failed => "failed",
            AuditOutcome::Dropped => "dropped",
        }
    }
}

/// Container for all Keypoint metrics.
#[derive(Clone)]
pub struct KeypointMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Result-store lookups - labels: outcome (hit/miss/error)
    pub cache_lookups_total: CounterVec,

    /// Detector initialization attempts - labels: outcome (success/failure)
    pub detector_warmups_total: CounterVec,

    /// 1 once the detector is ready, 0 before
    pub detector_ready: Gauge,

    /// Audit records - labels: outcome (written/failed/dropped)
    pub audit_records_total: CounterVec,
}

impl KeypointMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "keypoint_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register http_requests_total: {}", e)))?,

            http_request_duration_seconds: register_histogram_vec!(
                "keypoint_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register http_request_duration_seconds: {}", e)))?,

            cache_lookups_total: register_counter_vec!(
                "keypoint_cache_lookups_total",
                "Result-store lookups by outcome",
                &["outcome"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register cache_lookups_total: {}", e)))?,

            detector_warmups_total: register_counter_vec!(
                "keypoint_detector_warmups_total",
                "Detector initialization attempts by outcome",
                &["outcome"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register detector_warmups_total: {}", e)))?,

            detector_ready: register_gauge!(
                "keypoint_detector_ready",
                "Whether the shared detector has completed warmup"
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register detector_ready: {}", e)))?,

            audit_records_total: register_counter_vec!(
                "keypoint_audit_records_total",
                "Audit records by outcome",
                &["outcome"]
            )
            .map_err(|e| ApiError::internal_error(format!("Failed to register audit_records_total: {}", e)))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    pub fn record_cache_lookup(&self, outcome: CacheOutcome) {
        self.cache_lookups_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Record a finished detector initialization attempt.
    pub fn record_detector_warmup(&self, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.detector_warmups_total
            .with_label_values(&[outcome])
            .inc();
        if success {
            self.detector_ready.set(1.0);
        }
    }

    pub fn record_audit(&self, outcome: AuditOutcome) {
        self.audit_records_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}
