//! HTTP routes and router assembly.
//!
//! - `POST /process-image` and `GET /check-status` (see [`process`])
//! - Health checks at /health/* (Kubernetes-compatible)
//! - Prometheus metrics at /metrics, when enabled
//!
//! Every route, health checks included, runs behind the audit middleware.

pub mod health;
pub mod process;

use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ApiConfig;
use crate::constants::{CACHE_STATUS_HEADER, CHECK_STATUS_PATH, PROCESS_IMAGE_PATH};
use crate::middleware::{audit_middleware, AuditLayerState};
use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware, TelemetryConfig};

pub use health::create_router as health_router;
pub use process::{check_status, process_image};

/// Create the complete API router.
///
/// # Middleware Order (outer to inner)
/// 1. CORS (outermost) - handles preflight requests
/// 2. Observability - tracing and metrics
/// 3. Body limit - caps what the audit buffer and multipart reader accept
/// 4. Audit - fingerprints the upload, captures the response
pub fn create_api_router(state: AppState, telemetry: &TelemetryConfig) -> Router {
    let config = state.config.clone();

    let mut router = Router::new()
        .route(PROCESS_IMAGE_PATH, post(process_image))
        .route(CHECK_STATUS_PATH, get(check_status))
        .nest("/health", health::create_router());

    if telemetry.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let audit_state = AuditLayerState::new(
        state.audit.clone(),
        config.max_upload_bytes,
        config.max_capture_bytes,
    );

    router
        .layer(
            ServiceBuilder::new()
                .layer(build_cors_layer(&config))
                .layer(from_fn(observability_middleware))
                .layer(DefaultBodyLimit::max(config.max_upload_bytes))
                .layer(from_fn_with_state(audit_state, audit_middleware)),
        )
        .with_state(state)
}

// ============================================================================
// CORS LAYER
// ============================================================================

/// Build the CORS layer from ApiConfig.
///
/// In development mode (empty origins), allows all origins.
/// In production mode, only allows configured origins.
fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([HeaderName::from_static(CACHE_STATUS_HEADER)])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: Development mode - allowing all origins");
        cors.allow_origin(Any).allow_headers(Any)
    } else {
        tracing::info!(
            "CORS: Production mode - allowing origins: {:?}",
            config.cors_origins
        );
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}
