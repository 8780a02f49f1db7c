//! Request/response interception for auditing.
//!
//! Every exchange passes through [`audit_middleware`], which:
//!
//! 1. Buffers a multipart request body, fingerprints its first file
//!    field, and hands the handler an identical replayable body. Other
//!    bodies reach the handler untouched and carry no fingerprint.
//! 2. Buffers the response body and returns a response with the same
//!    status, headers and bytes.
//! 3. Submits an audit entry to the [`AuditSink`] without waiting for it
//!    to be written.
//!
//! Fingerprint extraction and response capture never fail the request;
//! problems are logged and the exchange continues.
//!
//! A handler that hashed the content it processed reports that fingerprint
//! as a [`ResultFingerprint`] response extension, and it replaces the one
//! extracted from the body. Only 2xx responses keep a fingerprint, so error
//! bodies are recorded but never served back as cached results.

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::{Request, State},
    http::header::CONTENT_LENGTH,
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::{stream, StreamExt};
use keypoint_core::{ExtractionError, Fingerprint};

use super::multipart::{fingerprint_first_file, is_multipart};
use crate::constants::{binary_placeholder, EXTRACTION_ERROR_PLACEHOLDER};
use crate::error::ApiError;
use crate::jobs::{AuditEntry, AuditSink};

/// State for the audit middleware.
#[derive(Clone)]
pub struct AuditLayerState {
    pub sink: AuditSink,
    /// Multipart bodies larger than this are rejected with 413.
    pub max_body_bytes: usize,
    /// Response bodies declaring a larger size are not captured.
    pub max_capture_bytes: usize,
}

impl AuditLayerState {
    pub fn new(sink: AuditSink, max_body_bytes: usize, max_capture_bytes: usize) -> Self {
        Self {
            sink,
            max_body_bytes,
            max_capture_bytes,
        }
    }
}

/// Fingerprint of the content a handler processed, attached to its
/// response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFingerprint(pub Fingerprint);

/// What was captured from a response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturedBody {
    /// The complete body.
    Complete(Bytes),
    /// The declared size exceeded the capture limit; the body was passed
    /// through untouched.
    Skipped { size: u64, limit: usize },
    /// Reading the body failed part way.
    Failed { reason: String },
}

impl CapturedBody {
    /// Text stored in the audit record.
    pub fn audit_text(&self) -> String {
        match self {
            CapturedBody::Complete(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => text.to_string(),
                Err(_) => binary_placeholder(bytes.len()),
            },
            CapturedBody::Skipped { size, limit } => {
                format!("<response not captured: {} bytes exceeds {} byte limit>", size, limit)
            }
            CapturedBody::Failed { .. } => EXTRACTION_ERROR_PLACEHOLDER.to_string(),
        }
    }
}

/// Audit middleware for Axum.
pub async fn audit_middleware(
    State(state): State<AuditLayerState>,
    request: Request,
    next: Next,
) -> Response {
    let operation = request.uri().path().to_string();

    let (response, fingerprint) = match buffer_request(request, state.max_body_bytes).await {
        Ok((request, fingerprint)) => (next.run(request).await, fingerprint),
        Err(rejection) => (ApiError::from(rejection).into_response(), None),
    };

    let reported = response
        .extensions()
        .get::<ResultFingerprint>()
        .map(|reported| reported.0.clone());
    let fingerprint = record_fingerprint(&operation, fingerprint, reported)
        .filter(|_| response.status().is_success());
    let (response, captured) = capture_response(response, state.max_capture_bytes).await;

    if let CapturedBody::Failed { reason } = &captured {
        tracing::warn!(operation = %operation, error = %reason, "Failed to capture response body");
    }

    state
        .sink
        .submit(AuditEntry::new(operation, captured.audit_text(), fingerprint));

    response
}

/// The handler's own fingerprint wins over the one extracted from the body.
fn record_fingerprint(
    operation: &str,
    extracted: Option<Fingerprint>,
    reported: Option<Fingerprint>,
) -> Option<Fingerprint> {
    match (extracted, reported) {
        (Some(extracted), Some(reported)) if extracted != reported => {
            tracing::debug!(
                operation = %operation,
                extracted = %extracted,
                processed = %reported,
                "Handler processed a different file than the first file field"
            );
            Some(reported)
        }
        (extracted, None) => extracted,
        (_, reported) => reported,
    }
}

/// Buffer a multipart request body, fingerprint it and rebuild the request
/// with an identical body. Non-multipart requests are returned as they are.
async fn buffer_request(
    request: Request,
    limit: usize,
) -> Result<(Request, Option<Fingerprint>), ExtractionError> {
    if !is_multipart(request.headers()) {
        return Ok((request, None));
    }

    let declared = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(size) = declared.filter(|len| *len > limit as u64) {
        return Err(ExtractionError::TooLarge { size, limit });
    }

    let (parts, body) = request.into_parts();
    let body_bytes = read_limited(body, limit).await?;

    let fingerprint = match fingerprint_first_file(&parts, body_bytes.clone()).await {
        Ok(fingerprint) => fingerprint,
        Err(e) => {
            tracing::warn!(
                path = %parts.uri.path(),
                error = %e,
                "Fingerprint extraction failed, continuing without fingerprint"
            );
            None
        }
    };

    Ok((Request::from_parts(parts, Body::from(body_bytes)), fingerprint))
}

/// Read a whole request body, rejecting it once it grows past `limit`.
async fn read_limited(body: Body, limit: usize) -> Result<Bytes, ExtractionError> {
    let mut data = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;
    while let Some(chunk) = data.next().await {
        let chunk = chunk.map_err(|e| ExtractionError::Body {
            reason: e.to_string(),
        })?;
        total += chunk.len();
        if total > limit {
            return Err(ExtractionError::TooLarge {
                size: total as u64,
                limit,
            });
        }
        chunks.push(chunk);
    }
    Ok(concat_chunks(chunks))
}

/// Buffer a response body for auditing and return an equivalent response.
///
/// If reading fails part way, the returned response replays the chunks
/// already read, then the error, then whatever the body would still have
/// produced, so the client sees exactly what it would have without
/// interception.
pub async fn capture_response(response: Response, limit: usize) -> (Response, CapturedBody) {
    let (parts, body) = response.into_parts();

    let declared = body.size_hint().lower();
    if declared > limit as u64 {
        return (
            Response::from_parts(parts, body),
            CapturedBody::Skipped {
                size: declared,
                limit,
            },
        );
    }

    let mut data = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    while let Some(next) = data.next().await {
        match next {
            Ok(chunk) => chunks.push(chunk),
            Err(err) => {
                let reason = err.to_string();
                let replay = stream::iter(chunks.into_iter().map(Ok::<Bytes, axum::Error>))
                    .chain(stream::once(async move { Err(err) }))
                    .chain(data);
                return (
                    Response::from_parts(parts, Body::from_stream(replay)),
                    CapturedBody::Failed { reason },
                );
            }
        }
    }

    let bytes = concat_chunks(chunks);
    (
        Response::from_parts(parts, Body::from(bytes.clone())),
        CapturedBody::Complete(bytes),
    )
}

fn concat_chunks(mut chunks: Vec<Bytes>) -> Bytes {
    match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.remove(0),
        _ => Bytes::from(chunks.concat()),
    }
}
