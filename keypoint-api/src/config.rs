//! API Configuration Module
//!
//! Configuration for the HTTP server, body limits, the detector and the
//! record store. Configuration is loaded from environment variables with
//! sensible defaults for development.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CORS_MAX_AGE_SECS, DEFAULT_MAX_CAPTURE_BYTES, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_PORT,
};

// ============================================================================
// STORE BACKEND
// ============================================================================

/// Which [`keypoint_storage::ResultStore`] implementation backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// PostgreSQL via deadpool (production).
    Postgres,
    /// Process-local vector; records are lost on restart.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StoreBackend::Postgres),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

// ============================================================================
// API CONFIGURATION
// ============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    // ========================================================================
    // Listener
    // ========================================================================
    pub bind_addr: IpAddr,
    pub port: u16,

    // ========================================================================
    // Body limits
    // ========================================================================
    /// Largest request body accepted, in bytes. Applies to the interception
    /// buffer and to the multipart extractor.
    pub max_upload_bytes: usize,

    /// Response bodies whose declared size exceeds this are passed through
    /// without being captured for the audit record.
    pub max_capture_bytes: usize,

    // ========================================================================
    // Detector
    // ========================================================================
    /// Directory for staged uploads. `None` uses the system temp dir.
    pub temp_dir: Option<PathBuf>,

    /// Start detector warmup at boot instead of on the first request.
    pub eager_warmup: bool,

    // ========================================================================
    // Storage
    // ========================================================================
    pub store_backend: StoreBackend,

    // ========================================================================
    // CORS Configuration
    // ========================================================================
    /// Allowed CORS origins (comma-separated in env var).
    /// Empty means allow all origins (dev mode).
    pub cors_origins: Vec<String>,

    /// Max age for CORS preflight cache in seconds.
    pub cors_max_age_secs: u64,

    /// How long graceful shutdown waits for in-flight requests.
    pub shutdown_grace: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
            temp_dir: None,
            eager_warmup: false,
            store_backend: StoreBackend::Postgres,
            cors_origins: Vec::new(), // Empty = allow all
            cors_max_age_secs: DEFAULT_CORS_MAX_AGE_SECS,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `KEYPOINT_API_BIND`: Listen address (default: 0.0.0.0)
    /// - `KEYPOINT_API_PORT` or `PORT`: Listen port (default: 8000)
    /// - `KEYPOINT_MAX_UPLOAD_BYTES`: Request body limit (default: 25 MiB)
    /// - `KEYPOINT_MAX_CAPTURE_BYTES`: Response capture limit (default: 10 MiB)
    /// - `KEYPOINT_TEMP_DIR`: Directory for staged uploads (default: system temp)
    /// - `KEYPOINT_EAGER_WARMUP`: "true" to warm the detector at boot (default: false)
    /// - `KEYPOINT_STORE`: "postgres" or "memory" (default: postgres)
    /// - `KEYPOINT_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    /// - `KEYPOINT_CORS_MAX_AGE_SECS`: Preflight cache duration (default: 86400)
    /// - `KEYPOINT_SHUTDOWN_GRACE_SECS`: Graceful shutdown budget (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = std::env::var("KEYPOINT_API_BIND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.bind_addr);

        let port = std::env::var("KEYPOINT_API_PORT")
            .or_else(|_| std::env::var("PORT"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.port);

        let max_upload_bytes = std::env::var("KEYPOINT_MAX_UPLOAD_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_upload_bytes);

        let max_capture_bytes = std::env::var("KEYPOINT_MAX_CAPTURE_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_capture_bytes);

        let temp_dir = std::env::var("KEYPOINT_TEMP_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let eager_warmup = std::env::var("KEYPOINT_EAGER_WARMUP")
            .map(|s| s.to_lowercase() == "true" || s == "1")
            .unwrap_or(false);

        let store_backend = match std::env::var("KEYPOINT_STORE") {
            Ok(raw) => raw.parse().unwrap_or_else(|e: String| {
                tracing::warn!(error = %e, "Falling back to postgres store backend");
                StoreBackend::Postgres
            }),
            Err(_) => defaults.store_backend,
        };

        let cors_origins = std::env::var("KEYPOINT_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let cors_max_age_secs = std::env::var("KEYPOINT_CORS_MAX_AGE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.cors_max_age_secs);

        let shutdown_grace = std::env::var("KEYPOINT_SHUTDOWN_GRACE_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_grace);

        Self {
            bind_addr,
            port,
            max_upload_bytes,
            max_capture_bytes,
            temp_dir,
            eager_warmup,
            store_backend,
            cors_origins,
            cors_max_age_secs,
            shutdown_grace,
        }
    }

    /// Socket address the server listens on.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}
