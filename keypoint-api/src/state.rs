//! Shared application state for Axum routers.

use std::sync::Arc;

use keypoint_storage::{InMemoryResultStore, SharedResultStore};

use crate::config::{ApiConfig, StoreBackend};
use crate::db::{DbConfig, PgResultStore};
use crate::error::ApiResult;
use crate::guard::DetectorGuard;
use crate::jobs::AuditSink;
use crate::services::ImageProcessingService;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    /// Record store, shared by the cache lookup and the audit sink.
    pub store: SharedResultStore,
    pub detector: DetectorGuard,
    pub audit: AuditSink,
    pub processing: Arc<ImageProcessingService>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: ApiConfig, store: SharedResultStore, detector: DetectorGuard, audit: AuditSink) -> Self {
        let processing = Arc::new(ImageProcessingService::new(
            store.clone(),
            detector.clone(),
            config.temp_dir.clone(),
        ));
        Self {
            config: Arc::new(config),
            store,
            detector,
            audit,
            processing,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Open the configured record store. The PostgreSQL backend creates its
/// table on first start.
pub async fn connect_store(config: &ApiConfig) -> ApiResult<SharedResultStore> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory record store, records are lost on restart");
            Ok(Arc::new(InMemoryResultStore::new()))
        }
        StoreBackend::Postgres => {
            let db_config = DbConfig::from_env();
            let store = PgResultStore::from_config(&db_config)?;
            store.ensure_schema().await?;
            tracing::info!(
                host = %db_config.host,
                dbname = %db_config.dbname,
                "Connected to PostgreSQL record store"
            );
            Ok(Arc::new(store))
        }
    }
}

crate::impl_from_ref!(Arc<ApiConfig>, config);
crate::impl_from_ref!(SharedResultStore, store);
crate::impl_from_ref!(DetectorGuard, detector);
crate::impl_from_ref!(AuditSink, audit);
crate::impl_from_ref!(Arc<ImageProcessingService>, processing);
crate::impl_from_ref!(std::time::Instant, start_time);
