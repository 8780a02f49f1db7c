//! Multipart form reading.
//!
//! Fields are classified by whether they carry a filename: a part with a
//! `filename` parameter is a file, anything else is a text field. Both the
//! interception middleware (fingerprinting) and the `/process-image`
//! handler read forms through [`next_form_field`].

use axum::{
    body::{Body, Bytes},
    extract::{FromRequest, Multipart},
    http::{header::CONTENT_TYPE, request::Parts, HeaderMap, Request},
};
use keypoint_core::{ExtractionError, Fingerprint};

/// One decoded form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormField {
    Text(TextField),
    File(FileField),
}

impl FormField {
    pub fn name(&self) -> &str {
        match self {
            FormField::Text(text) => &text.name,
            FormField::File(file) => &file.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextField {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileField {
    pub name: String,
    /// Client-supplied filename; may be empty.
    pub file_name: String,
    pub content_type: Option<String>,
    pub content: Bytes,
}

/// Whether the headers declare a `multipart/form-data` body.
pub fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

/// Read the next field, fully buffering its content.
pub async fn next_form_field(
    multipart: &mut Multipart,
) -> Result<Option<FormField>, ExtractionError> {
    let field = match multipart.next_field().await.map_err(multipart_error)? {
        Some(field) => field,
        None => return Ok(None),
    };

    let name = field.name().unwrap_or_default().to_string();
    match field.file_name().map(str::to_string) {
        Some(file_name) => {
            let content_type = field.content_type().map(str::to_string);
            let content = field.bytes().await.map_err(multipart_error)?;
            Ok(Some(FormField::File(FileField {
                name,
                file_name,
                content_type,
                content,
            })))
        }
        None => {
            let value = field.text().await.map_err(multipart_error)?;
            Ok(Some(FormField::Text(TextField { name, value })))
        }
    }
}

/// Fingerprint the first file field of a buffered multipart body.
///
/// Returns `Ok(None)` for non-multipart bodies and for forms without a
/// file field. `parts` supplies the headers and extensions (including any
/// body limit) the original request was received with; the body itself is
/// only read from `body`.
pub async fn fingerprint_first_file(
    parts: &Parts,
    body: Bytes,
) -> Result<Option<Fingerprint>, ExtractionError> {
    if !is_multipart(&parts.headers) {
        return Ok(None);
    }

    let mut probe = Request::new(Body::from(body));
    *probe.headers_mut() = parts.headers.clone();
    *probe.extensions_mut() = parts.extensions.clone();

    let mut multipart = Multipart::from_request(probe, &())
        .await
        .map_err(|e| ExtractionError::Multipart {
            reason: e.to_string(),
        })?;

    while let Some(field) = next_form_field(&mut multipart).await? {
        if let FormField::File(file) = field {
            return Ok(Some(Fingerprint::of(&file.content)));
        }
    }
    Ok(None)
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ExtractionError {
    ExtractionError::Multipart {
        reason: err.body_text(),
    }
}
