//! Image Processing Service
//!
//! Serves `/process-image`: fingerprint the upload, answer from stored
//! results when the same content was processed before, otherwise run the
//! shared detector on a staged copy of the upload.
//!
//! This service never writes records. Fresh results reach the store via
//! the audit middleware, which records the response together with the
//! upload's fingerprint.

use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};

use axum::body::Bytes;
use keypoint_core::{DetectionResult, Fingerprint, RecordId};
use keypoint_storage::SharedResultStore;
use tempfile::TempPath;

use crate::constants::{MAX_UPLOAD_SUFFIX_LEN, UPLOAD_TEMP_PREFIX};
use crate::error::{ApiError, ApiResult};
use crate::guard::DetectorGuard;
use crate::telemetry::{metrics, CacheOutcome};

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the stored record with this id.
    Hit { record_id: RecordId },
    /// Computed by the detector for this request.
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit { .. } => "hit",
            CacheStatus::Miss => "miss",
        }
    }
}

/// Outcome of processing one upload.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedUpload {
    pub fingerprint: Fingerprint,
    pub result: DetectionResult,
    pub cache: CacheStatus,
}

pub struct ImageProcessingService {
    store: SharedResultStore,
    detector: DetectorGuard,
    temp_dir: Option<PathBuf>,
}

impl ImageProcessingService {
    pub fn new(store: SharedResultStore, detector: DetectorGuard, temp_dir: Option<PathBuf>) -> Self {
        Self {
            store,
            detector,
            temp_dir,
        }
    }

    /// Process one upload.
    ///
    /// Two concurrent uploads of the same new content both miss and both
    /// run the detector; the first recorded result wins later lookups.
    pub async fn process_upload(&self, content: Bytes, file_name: &str) -> ApiResult<ProcessedUpload> {
        let fingerprint = Fingerprint::of(&content);

        if let Some((record_id, result)) = self.lookup(&fingerprint).await {
            tracing::debug!(fingerprint = %fingerprint, record_id, "Serving stored result");
            return Ok(ProcessedUpload {
                fingerprint,
                result,
                cache: CacheStatus::Hit { record_id },
            });
        }

        let staged = self.stage_upload(content, file_name).await?;
        let detector = self.detector.get().await?;
        let processed = detector.process(&staged).await;
        discard(staged).await;

        let result = processed.map_err(|e| {
            tracing::error!(fingerprint = %fingerprint, error = %e, "Detector failed on upload");
            ApiError::from(e)
        })?;

        tracing::debug!(fingerprint = %fingerprint, "Processed upload");
        Ok(ProcessedUpload {
            fingerprint,
            result,
            cache: CacheStatus::Miss,
        })
    }

    /// Look up a stored result. Store failures and records without a
    /// payload count as misses.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<(RecordId, DetectionResult)> {
        let (outcome, found) = match self.store.find_by_fingerprint(fingerprint).await {
            Ok(Some(record)) => match record.payload {
                Some(payload) => (CacheOutcome::Hit, Some((record.id, payload))),
                None => (CacheOutcome::Miss, None),
            },
            Ok(None) => (CacheOutcome::Miss, None),
            Err(e) => {
                tracing::warn!(
                    fingerprint = %fingerprint,
                    error = %e,
                    "Result lookup failed, processing as a miss"
                );
                (CacheOutcome::Error, None)
            }
        };

        if let Some(metrics) = metrics() {
            metrics.record_cache_lookup(outcome);
        }
        found
    }

    /// Write the upload to a uniquely named temp file carrying the
    /// client's file extension. The file is removed when the returned
    /// path is dropped.
    async fn stage_upload(&self, content: Bytes, file_name: &str) -> ApiResult<TempPath> {
        let suffix = upload_suffix(file_name);
        let dir = self.temp_dir.clone();

        let staged = tokio::task::spawn_blocking(move || -> std::io::Result<TempPath> {
            let mut builder = tempfile::Builder::new();
            builder.prefix(UPLOAD_TEMP_PREFIX).suffix(&suffix);
            let mut file = match dir {
                Some(dir) => builder.tempfile_in(dir)?,
                None => builder.tempfile()?,
            };
            file.write_all(&content)?;
            file.flush()?;
            Ok(file.into_temp_path())
        })
        .await
        .map_err(|e| ApiError::internal_error(format!("Upload staging task failed: {}", e)))??;

        Ok(staged)
    }
}

/// Remove a staged upload, logging rather than failing on errors.
async fn discard(staged: TempPath) {
    let path = staged.to_path_buf();
    match tokio::task::spawn_blocking(move || staged.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged upload"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Staged upload cleanup task failed"),
    }
}

/// Extension of the client's filename, with its dot, or empty when the
/// name has none or it is not a short alphanumeric extension.
pub fn upload_suffix(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(OsStr::to_str)
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_UPLOAD_SUFFIX_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use keypoint_core::NewAuditRecord;
    use keypoint_storage::{InMemoryResultStore, ResultStore};
    use keypoint_test_utils::{FailingResultStore, MockDetectorFactory};
    use serde_json::json;
    use std::sync::Arc;

    struct Harness {
        service: ImageProcessingService,
        store: Arc<InMemoryResultStore>,
        calls: Arc<keypoint_test_utils::DetectorCalls>,
        temp: tempfile::TempDir,
    }

    fn harness(factory: MockDetectorFactory) -> Harness {
        let store = Arc::new(InMemoryResultStore::new());
        let calls = factory.calls();
        let temp = tempfile::tempdir().expect("temp dir");
        let service = ImageProcessingService::new(
            store.clone(),
            DetectorGuard::new(Arc::new(factory)),
            Some(temp.path().to_path_buf()),
        );
        Harness {
            service,
            store,
            calls,
            temp,
        }
    }

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_miss_runs_detector_and_does_not_persist() -> Result<(), Box<dyn std::error::Error>> {
        let h = harness(MockDetectorFactory::new());

        let out = h
            .service
            .process_upload(Bytes::from_static(b"new image"), "cat.png")
            .await?;

        assert_eq!(out.cache, CacheStatus::Miss);
        assert_eq!(out.fingerprint, Fingerprint::of(b"new image"));
        assert_eq!(out.result["bytes"], json!(9));
        assert_eq!(h.calls.processed(), 1);
        assert!(h.store.is_empty()?);
        Ok(())
    }

    #[tokio::test]
    async fn test_hit_skips_detector() -> Result<(), Box<dyn std::error::Error>> {
        let h = harness(MockDetectorFactory::new());
        let fp = Fingerprint::of(b"seen before");
        let stored = h
            .store
            .append(NewAuditRecord::new(
                "/process-image",
                Some(json!({"keypoints": 3})),
                Some(fp.clone()),
            ))
            .await?;

        let out = h
            .service
            .process_upload(Bytes::from_static(b"seen before"), "x.jpg")
            .await?;

        assert_eq!(out.cache, CacheStatus::Hit { record_id: stored.id });
        assert_eq!(out.result, json!({"keypoints": 3}));
        assert_eq!(h.calls.constructs(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_record_without_payload_is_a_miss() -> Result<(), Box<dyn std::error::Error>> {
        let h = harness(MockDetectorFactory::new());
        h.store
            .append(NewAuditRecord::new(
                "/process-image",
                None,
                Some(Fingerprint::of(b"empty body")),
            ))
            .await?;

        let out = h
            .service
            .process_upload(Bytes::from_static(b"empty body"), "a.png")
            .await?;
        assert_eq!(out.cache, CacheStatus::Miss);
        assert_eq!(h.calls.processed(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_miss() -> Result<(), ApiError> {
        let factory = MockDetectorFactory::new();
        let calls = factory.calls();
        let store = Arc::new(FailingResultStore::new());
        let service = ImageProcessingService::new(
            store.clone(),
            DetectorGuard::new(Arc::new(factory)),
            None,
        );

        let out = service
            .process_upload(Bytes::from_static(b"image"), "a.png")
            .await?;
        assert_eq!(out.cache, CacheStatus::Miss);
        assert_eq!(calls.processed(), 1);
        assert_eq!(store.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_staged_file_keeps_suffix_and_is_removed() -> Result<(), ApiError> {
        let h = harness(MockDetectorFactory::new());

        h.service
            .process_upload(Bytes::from_static(b"pixels"), "holiday.JPEG")
            .await?;

        let paths = h.calls.processed_paths();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].extension().and_then(OsStr::to_str), Some("JPEG"));
        assert!(paths[0].starts_with(h.temp.path()));
        assert!(!paths[0].exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_init_failure_is_unavailable_and_cleans_up() {
        let h = harness(MockDetectorFactory::new().failing_warmups(1));

        let err = h
            .service
            .process_upload(Bytes::from_static(b"image"), "a.png")
            .await
            .expect_err("warmup fails");
        assert_eq!(err.code, ErrorCode::DetectorUnavailable);
        assert_eq!(staged_files(h.temp.path()), 0);

        // The next request retries initialization.
        let out = h
            .service
            .process_upload(Bytes::from_static(b"image"), "a.png")
            .await
            .expect("retry succeeds");
        assert_eq!(out.cache, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_processing_failure_is_reported_and_cleans_up() {
        let h = harness(MockDetectorFactory::new().rejecting_inputs());

        let err = h
            .service
            .process_upload(Bytes::from_static(b"garbage"), "a.png")
            .await
            .expect_err("detector rejects");
        assert_eq!(err.code, ErrorCode::ProcessingFailed);
        assert_eq!(staged_files(h.temp.path()), 0);
    }

    #[test]
    fn test_upload_suffix() {
        assert_eq!(upload_suffix("photo.png"), ".png");
        assert_eq!(upload_suffix("archive.tar.GZ"), ".GZ");
        assert_eq!(upload_suffix("../../etc/passwd.jpg"), ".jpg");
        assert_eq!(upload_suffix("noext"), "");
        assert_eq!(upload_suffix(""), "");
        assert_eq!(upload_suffix(".hidden"), "");
        assert_eq!(upload_suffix("bad.ex t"), "");
        assert_eq!(upload_suffix("long.abcdefghijklmnopq"), "");
    }
}
