//! Interception pipeline tests.
//!
//! Every exchange is audited without changing what the handler receives or
//! what the caller gets back. Only successful responses carry the upload's
//! fingerprint into the record.

use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use keypoint_api::routes::process_image;
use keypoint_test_utils::fixtures::{image_upload, png_bytes, MultipartForm};
use keypoint_test_utils::generators::{arb_file_name, arb_text_value, arb_upload_bytes};
use keypoint_test_utils::{Fingerprint, MockDetectorFactory};
use proptest::prelude::*;
use serde_json::json;
use tokio::runtime::Runtime;

#[path = "support/app.rs"]
mod test_app;
use test_app::{form_request, TestApp};

#[tokio::test]
async fn test_upload_is_audited_with_fingerprint() {
    let app = TestApp::new();
    let content = png_bytes(4, 4);

    let response = app.post_form(&image_upload("tiny.png", &content)).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.cache_status(), Some("miss"));

    let records = app.wait_for_records(1).await;
    let record = &records[0];
    assert_eq!(record.operation, "/process-image");
    assert_eq!(record.fingerprint, Some(Fingerprint::of(&content)));
    assert_eq!(record.payload, Some(response.json()));
}

#[tokio::test]
async fn test_response_identical_with_and_without_interception() {
    let app = TestApp::new();
    let form = image_upload("photo.png", &png_bytes(32, 16));

    let bare: Router = Router::new()
        .route("/process-image", post(process_image))
        .with_state(app.state.clone());
    let direct = {
        use tower::ServiceExt;
        let response = bare.oneshot(form_request(&form)).await.expect("bare router");
        let status = response.status();
        let content_type = response.headers()["content-type"].clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, content_type, body)
    };

    let intercepted = app.post_form(&form).await;
    assert_eq!(intercepted.status, direct.0);
    assert_eq!(intercepted.headers["content-type"], direct.1);
    assert_eq!(intercepted.body, direct.2);
}

#[tokio::test]
async fn test_non_multipart_request_has_no_fingerprint() {
    let app = TestApp::new();

    let response = app.get("/check-status").await;
    assert_eq!(response.status, StatusCode::OK);

    let records = app.wait_for_records(1).await;
    assert_eq!(records[0].operation, "/check-status");
    assert_eq!(records[0].fingerprint, None);
    assert_eq!(records[0].payload, Some(json!(false)));
}

#[tokio::test]
async fn test_plain_text_response_stored_as_string() {
    let app = TestApp::new();

    let response = app.get("/health/ping").await;
    assert_eq!(&response.body[..], b"pong");

    let records = app.wait_for_records(1).await;
    assert_eq!(records[0].payload, Some(json!("pong")));
}

#[tokio::test]
async fn test_failed_processing_is_audited_without_fingerprint() {
    let app = TestApp::builder()
        .factory(MockDetectorFactory::new().rejecting_inputs())
        .build();
    let form = image_upload("bad.png", b"not really a png");

    let response = app.post_form(&form).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.json()["code"], "PROCESSING_FAILED");

    let records = app.wait_for_records(1).await;
    assert_eq!(records[0].fingerprint, None);
    assert_eq!(records[0].payload, Some(response.json()));

    // The failure was not cached: the detector runs again.
    let retry = app.post_form(&form).await;
    assert_eq!(retry.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(app.calls.processed(), 2);
}

#[tokio::test]
async fn test_missing_file_field_is_rejected() {
    let app = TestApp::new();
    let form = MultipartForm::new()
        .text("note", "no upload here")
        .file("attachment", "a.png", "image/png", &png_bytes(1, 1));

    let response = app.post_form(&form).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["code"], "MISSING_FIELD");
    assert_eq!(app.calls.constructs(), 0);

    // The interception layer still fingerprinted the first file field,
    // but a 400 never carries it into the record.
    let records = app.wait_for_records(1).await;
    assert_eq!(records[0].fingerprint, None);
}

#[tokio::test]
async fn test_non_multipart_upload_is_rejected() {
    let app = TestApp::new();
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/process-image")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(r#"{"file":"nope"}"#))
        .expect("request");

    let response = app.send(request).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_oversized_upload_is_rejected_and_audited() {
    let app = TestApp::builder().max_upload_bytes(512).build();
    let form = image_upload("big.bin", &vec![7u8; 2048]);

    let response = app.post_form(&form).await;
    assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(response.json()["code"], "PAYLOAD_TOO_LARGE");
    assert_eq!(app.calls.processed(), 0);

    let records = app.wait_for_records(1).await;
    assert_eq!(records[0].fingerprint, None);
}

#[tokio::test]
async fn test_first_file_field_is_fingerprinted() {
    let app = TestApp::new();
    let upload = png_bytes(2, 2);
    let form = MultipartForm::new()
        .text("caption", "first a text field")
        .file("file", "first.png", "image/png", &upload)
        .file("thumbnail", "second.png", "image/png", &png_bytes(1, 1));

    let response = app.post_form(&form).await;
    assert_eq!(response.status, StatusCode::OK);

    let records = app.wait_for_records(1).await;
    assert_eq!(records[0].fingerprint, Some(Fingerprint::of(&upload)));
}

#[tokio::test]
async fn test_large_non_multipart_body_reaches_handler() {
    let app = TestApp::builder().max_upload_bytes(512).build();
    let request = axum::http::Request::builder()
        .method("GET")
        .uri("/check-status")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(vec![b' '; 4096]))
        .expect("request");

    let response = app.send(request).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json(), json!(false));

    let records = app.wait_for_records(1).await;
    assert_eq!(records[0].fingerprint, None);
}

#[tokio::test]
async fn test_audit_store_failure_does_not_affect_response() {
    let app = TestApp::builder()
        .store(std::sync::Arc::new(keypoint_test_utils::FailingResultStore::new()))
        .build();

    let response = app.post_form(&image_upload("a.png", &png_bytes(3, 3))).await;
    assert_eq!(response.status, StatusCode::OK);

    let snapshot = app.shutdown().await;
    assert_eq!(snapshot.submitted, 1);
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.written, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// The handler sees exactly the uploaded bytes after the interception
    /// layer has consumed and replayed the body, text fields included.
    #[test]
    fn prop_upload_bytes_survive_interception(
        content in arb_upload_bytes(),
        file_name in arb_file_name(),
        caption in arb_text_value(),
    ) {
        let rt = Runtime::new().map_err(|e| TestCaseError::fail(e.to_string()))?;
        rt.block_on(async {
            let app = TestApp::new();
            let form = MultipartForm::new()
                .text("caption", &caption)
                .file("file", &file_name, "application/octet-stream", &content);
            let response = app.post_form(&form).await;
            prop_assert_eq!(response.status, StatusCode::OK);

            let expected = Fingerprint::of(&content);
            let body = response.json();
            prop_assert_eq!(&body["sha256"], &json!(expected.as_str()));
            prop_assert_eq!(&body["bytes"], &json!(content.len()));

            let records = app.wait_for_records(1).await;
            prop_assert_eq!(records[0].fingerprint.as_ref(), Some(&expected));
            Ok(())
        })?;
    }
}
