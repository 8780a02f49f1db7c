//! Shared detector lifecycle through the HTTP surface: lazy warmup on the
//! first miss, one warmup for concurrent callers, retry after failure, and
//! a side-effect-free `/check-status`.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use futures_util::future::join_all;
use keypoint_test_utils::fixtures::{image_upload, png_bytes};
use keypoint_test_utils::{FailingResultStore, MockDetectorFactory};
use serde_json::json;

#[path = "support/app.rs"]
mod test_app;
use test_app::TestApp;

#[tokio::test]
async fn test_check_status_reports_readiness_without_warming() {
    let app = TestApp::new();

    for _ in 0..3 {
        let response = app.get("/check-status").await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.json(), json!(false));
    }
    assert_eq!(app.detector.attempts(), 0);
    assert_eq!(app.calls.constructs(), 0);

    app.post_form(&image_upload("a.png", &png_bytes(1, 1))).await;

    let response = app.get("/check-status").await;
    assert_eq!(response.json(), json!(true));
}

#[tokio::test]
async fn test_concurrent_first_requests_share_one_warmup() {
    let app = TestApp::builder()
        .factory(MockDetectorFactory::new().with_warmup_delay(Duration::from_millis(50)))
        .build();

    let forms: Vec<_> = (0..8u32)
        .map(|n| image_upload("img.png", &png_bytes(n + 1, n + 1)))
        .collect();
    let responses = join_all(forms.iter().map(|form| app.post_form(form))).await;

    assert!(responses.iter().all(|r| r.status == StatusCode::OK));
    assert_eq!(app.calls.constructs(), 1);
    assert_eq!(app.calls.warmups(), 1);
    assert_eq!(app.calls.processed(), 8);
    assert_eq!(app.detector.attempts(), 1);
}

#[tokio::test]
async fn test_failed_warmup_is_retried_on_next_request() {
    let app = TestApp::builder()
        .factory(MockDetectorFactory::new().failing_warmups(1))
        .build();
    let form = image_upload("a.png", &png_bytes(2, 2));

    let first = app.post_form(&form).await;
    assert_eq!(first.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(first.json()["code"], "DETECTOR_UNAVAILABLE");
    assert_eq!(app.get("/check-status").await.json(), json!(false));

    let second = app.post_form(&form).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(app.get("/check-status").await.json(), json!(true));
    assert_eq!(app.calls.constructs(), 2);
}

#[tokio::test]
async fn test_all_waiters_of_failed_attempt_get_the_error() {
    let app = TestApp::builder()
        .factory(
            MockDetectorFactory::new()
                .failing_warmups(1)
                .with_warmup_delay(Duration::from_millis(200)),
        )
        .build();

    let forms: Vec<_> = (0..4u32)
        .map(|n| image_upload("img.png", &png_bytes(n + 1, 1)))
        .collect();
    let responses = join_all(forms.iter().map(|form| app.post_form(form))).await;

    assert!(responses
        .iter()
        .all(|r| r.status == StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(app.detector.attempts(), 1);
}

#[tokio::test]
async fn test_two_failed_waves_then_success() {
    let app = TestApp::builder()
        .factory(
            MockDetectorFactory::new()
                .failing_warmups(2)
                .with_warmup_delay(Duration::from_millis(200)),
        )
        .build();

    for wave in 1..=3u32 {
        let forms: Vec<_> = (0..4u32)
            .map(|n| image_upload("img.png", &png_bytes(wave, n + 1)))
            .collect();
        let (responses, ready_during_warmup) = tokio::join!(
            join_all(forms.iter().map(|form| app.post_form(form))),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                app.detector.is_ready()
            }
        );
        assert!(!ready_during_warmup, "ready while wave {} was warming up", wave);

        let expected = if wave < 3 {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        };
        assert!(responses.iter().all(|r| r.status == expected));
        assert_eq!(app.detector.attempts(), u64::from(wave));
        assert_eq!(app.get("/check-status").await.json(), json!(wave == 3));
    }

    assert_eq!(app.calls.warmups(), 3);
    // Only the successful attempt's detector ever processed anything.
    assert_eq!(app.calls.processed(), 4);
}

#[tokio::test]
async fn test_readiness_reports_cold_detector_as_degraded() {
    let app = TestApp::new();

    let response = app.get("/health/ready").await;
    assert_eq!(response.status, StatusCode::OK);
    let body = response.json();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["details"]["store"]["status"], "healthy");
    assert_eq!(body["details"]["detector"]["status"], "degraded");

    app.post_form(&image_upload("a.png", &png_bytes(1, 1))).await;
    let response = app.get("/health/ready").await;
    assert_eq!(response.json()["status"], "healthy");
}

#[tokio::test]
async fn test_readiness_fails_when_store_is_down() {
    let app = TestApp::builder()
        .store(Arc::new(FailingResultStore::new()))
        .build();

    let response = app.get("/health/ready").await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json()["status"], "unhealthy");
}

#[tokio::test]
async fn test_liveness_and_metrics_routes() {
    let app = TestApp::new();

    let live = app.get("/health/live").await;
    assert_eq!(live.status, StatusCode::OK);
    assert_eq!(live.json()["status"], "healthy");

    app.get("/check-status").await;
    let metrics = app.get("/metrics").await;
    assert_eq!(metrics.status, StatusCode::OK);
    let text = String::from_utf8_lossy(&metrics.body);
    assert!(text.contains("keypoint_http_requests_total"));
}
