//! Keypoint API Server Entry Point
//!
//! Bootstraps configuration, opens the record store, starts the audit sink
//! and serves the Axum router until SIGINT/SIGTERM.

use std::future::IntoFuture;
use std::sync::Arc;

use axum::Router;
use keypoint_api::telemetry::{init_tracing, TelemetryConfig};
use keypoint_api::{
    connect_store, create_api_router, ApiConfig, ApiError, ApiResult, AppState, AuditSink,
    AuditSinkConfig, DetectorGuard, FormatProbeFactory,
};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracing(&telemetry_config)?;

    let api_config = ApiConfig::from_env();
    let addr = api_config.socket_addr();
    let shutdown_grace = api_config.shutdown_grace;

    let store = connect_store(&api_config).await?;

    let detector = DetectorGuard::new(Arc::new(FormatProbeFactory));
    if api_config.eager_warmup {
        tracing::info!("Eager warmup enabled, initializing detector in the background");
        detector.prewarm();
    }

    let (audit, audit_worker) = AuditSink::spawn(store.clone(), AuditSinkConfig::from_env());

    let state = AppState::new(api_config, store, detector, audit);
    let app: Router = create_api_router(state, &telemetry_config);

    tracing::info!(
        %addr,
        service = %telemetry_config.service_name,
        version = %telemetry_config.service_version,
        "Starting Keypoint API server"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let (signalled_tx, mut signalled_rx) = watch::channel(false);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(true);
        })
        .into_future();

    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = async {
            if signalled_rx.wait_for(|signalled| *signalled).await.is_err() {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(shutdown_grace).await;
        } => {
            tracing::warn!(
                grace_secs = shutdown_grace.as_secs(),
                "In-flight requests did not finish before the shutdown grace period"
            );
        }
    }

    let drained = audit_worker.shutdown().await;
    tracing::info!(
        submitted = drained.submitted,
        written = drained.written,
        failed = drained.failed,
        dropped = drained.dropped,
        "Audit sink drained"
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
