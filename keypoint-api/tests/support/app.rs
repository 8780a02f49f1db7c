//! In-process test harness: the full router over an in-memory store and a
//! scripted detector, driven with `oneshot` (no sockets).

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use keypoint_api::telemetry::{LogFormat, TelemetryConfig};
use keypoint_api::{
    create_api_router, ApiConfig, AppState, AuditSink, AuditSinkConfig, AuditSinkSnapshot,
    AuditWorker, DetectorGuard, StoreBackend,
};
use keypoint_test_utils::fixtures::MultipartForm;
use keypoint_test_utils::{
    AuditRecord, DetectorCalls, InMemoryResultStore, MockDetectorFactory, SharedResultStore,
};
use tempfile::TempDir;
use tower::ServiceExt;

/// Captured response.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("response body is JSON")
    }

    pub fn cache_status(&self) -> Option<&str> {
        self.headers
            .get("x-keypoint-cache")
            .and_then(|v| v.to_str().ok())
    }
}

pub struct TestAppBuilder {
    factory: MockDetectorFactory,
    store: Option<SharedResultStore>,
    max_upload_bytes: Option<usize>,
    queue_capacity: usize,
}

impl TestAppBuilder {
    pub fn factory(mut self, factory: MockDetectorFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Replace the in-memory store (e.g. with a failing one).
    pub fn store(mut self, store: SharedResultStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn max_upload_bytes(mut self, limit: usize) -> Self {
        self.max_upload_bytes = Some(limit);
        self
    }

    pub fn build(self) -> TestApp {
        let memory = Arc::new(InMemoryResultStore::new());
        let store: SharedResultStore = match self.store {
            Some(store) => store,
            None => memory.clone(),
        };

        let temp_dir = tempfile::tempdir().expect("temp dir");
        let mut config = ApiConfig::default();
        config.store_backend = StoreBackend::Memory;
        config.temp_dir = Some(temp_dir.path().to_path_buf());
        if let Some(limit) = self.max_upload_bytes {
            config.max_upload_bytes = limit;
        }

        let calls = self.factory.calls();
        let detector = DetectorGuard::new(Arc::new(self.factory));
        let (audit, worker) = AuditSink::spawn(
            store.clone(),
            AuditSinkConfig {
                queue_capacity: self.queue_capacity,
                max_in_flight: 4,
                shutdown_timeout: Duration::from_secs(5),
            },
        );

        let state = AppState::new(config, store, detector.clone(), audit.clone());
        let router = create_api_router(state.clone(), &test_telemetry());

        TestApp {
            router,
            state,
            memory,
            detector,
            calls,
            audit,
            worker,
            temp_dir,
        }
    }
}

pub struct TestApp {
    pub router: Router,
    /// State behind `router`, for building routers without middleware.
    pub state: AppState,
    /// The default store; unused when the builder was given another one.
    pub memory: Arc<InMemoryResultStore>,
    pub detector: DetectorGuard,
    pub calls: Arc<DetectorCalls>,
    pub audit: AuditSink,
    worker: AuditWorker,
    temp_dir: TempDir,
}

impl TestApp {
    pub fn builder() -> TestAppBuilder {
        TestAppBuilder {
            factory: MockDetectorFactory::new(),
            store: None,
            max_upload_bytes: None,
            queue_capacity: 64,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body");
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        self.send(request).await
    }

    pub async fn post_form(&self, form: &MultipartForm) -> TestResponse {
        self.send(form_request(form)).await
    }

    /// Wait until the in-memory store holds at least `n` records.
    pub async fn wait_for_records(&self, n: usize) -> Vec<AuditRecord> {
        for _ in 0..400 {
            let records = self.memory.records().expect("records");
            if records.len() >= n {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {} audit records, found {}",
            n,
            self.memory.len().unwrap_or(0)
        );
    }

    /// Number of files left in the staging directory.
    pub fn staged_files(&self) -> usize {
        std::fs::read_dir(self.temp_dir.path())
            .expect("temp dir readable")
            .count()
    }

    /// Drain the audit sink and return its counters.
    pub async fn shutdown(self) -> AuditSinkSnapshot {
        drop(self.router);
        self.worker.shutdown().await
    }
}

pub fn form_request(form: &MultipartForm) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/process-image")
        .header("content-type", form.content_type())
        .body(Body::from(form.body()))
        .expect("request")
}

fn test_telemetry() -> TelemetryConfig {
    TelemetryConfig {
        service_name: "keypoint-api-test".to_string(),
        service_version: "test".to_string(),
        log_format: LogFormat::Json,
        metrics_enabled: true,
    }
}
