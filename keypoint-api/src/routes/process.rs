//! Image processing endpoints.
//!
//! - `POST /process-image`: multipart upload, field `file`. Responds with
//!   the detection result as JSON, served from stored results when the
//!   same bytes were processed before.
//! - `GET /check-status`: JSON boolean, whether the detector is ready.

use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    http::HeaderName,
    response::IntoResponse,
    Extension, Json,
};

use crate::constants::{CACHE_STATUS_HEADER, UPLOAD_FIELD};
use crate::error::{ApiError, ApiResult};
use crate::guard::DetectorGuard;
use crate::middleware::multipart::{next_form_field, FileField, FormField};
use crate::middleware::ResultFingerprint;
use crate::services::ImageProcessingService;

/// POST /process-image
pub async fn process_image(
    State(service): State<Arc<ImageProcessingService>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<impl IntoResponse> {
    let mut multipart = multipart.map_err(|e| ApiError::invalid_input(e.body_text()))?;
    let upload = find_upload(&mut multipart).await?;

    tracing::debug!(
        file_name = %upload.file_name,
        bytes = upload.content.len(),
        "Received upload"
    );

    let processed = service
        .process_upload(upload.content, &upload.file_name)
        .await?;

    // The audit layer records the result under the hash of the bytes that
    // were processed, not of whichever file field came first.
    Ok((
        Extension(ResultFingerprint(processed.fingerprint)),
        [(HeaderName::from_static(CACHE_STATUS_HEADER), processed.cache.as_str())],
        Json(processed.result),
    ))
}

/// GET /check-status
///
/// Reads the guard's state only; never starts initialization.
pub async fn check_status(State(detector): State<DetectorGuard>) -> Json<bool> {
    Json(detector.is_ready())
}

/// First file field named `file`. Other fields are read and skipped.
async fn find_upload(multipart: &mut Multipart) -> ApiResult<FileField> {
    while let Some(field) = next_form_field(multipart).await? {
        match field {
            FormField::File(file) if file.name == UPLOAD_FIELD => return Ok(file),
            other => tracing::trace!(field = other.name(), "Skipping form field"),
        }
    }
    Err(ApiError::missing_field(UPLOAD_FIELD))
}
