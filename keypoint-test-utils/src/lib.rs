//! Keypoint Test Utilities
//!
//! Centralized test infrastructure for the Keypoint workspace:
//! - Mock detectors and result stores
//! - Proptest generators for uploads
//! - Fixtures for image bytes and multipart bodies
//! - Environment variable guards

pub use keypoint_core::{
    AuditRecord, DetectionResult, Detector, DetectorError, DetectorFactory, Fingerprint,
    NewAuditRecord, SharedDetector, StorageError,
};
pub use keypoint_storage::{InMemoryResultStore, ResultStore, SharedResultStore};

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// MOCK DETECTOR
// ============================================================================

/// Call counters shared by a [`MockDetectorFactory`] and every detector it
/// constructs.
#[derive(Debug, Default)]
pub struct DetectorCalls {
    constructs: AtomicUsize,
    warmups: AtomicUsize,
    processed: AtomicUsize,
    paths: Mutex<Vec<PathBuf>>,
}

impl DetectorCalls {
    pub fn constructs(&self) -> usize {
        self.constructs.load(Ordering::SeqCst)
    }

    pub fn warmups(&self) -> usize {
        self.warmups.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Paths handed to `process`, in call order.
    pub fn processed_paths(&self) -> Vec<PathBuf> {
        self.paths.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

/// How a scripted warmup failure manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupFailure {
    Error,
    Panic,
}

/// Detector factory with scripted behavior.
///
/// The detector it builds reads the staged file and answers with its size
/// and SHA-256, so distinct uploads produce distinct results.
#[derive(Debug, Clone)]
pub struct MockDetectorFactory {
    calls: Arc<DetectorCalls>,
    remaining_failures: Arc<AtomicUsize>,
    failure_mode: WarmupFailure,
    warmup_delay: Duration,
    process_delay: Duration,
    reject_inputs: bool,
    keypoints: bool,
}

impl Default for MockDetectorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDetectorFactory {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(DetectorCalls::default()),
            remaining_failures: Arc::new(AtomicUsize::new(0)),
            failure_mode: WarmupFailure::Error,
            warmup_delay: Duration::ZERO,
            process_delay: Duration::ZERO,
            reject_inputs: false,
            keypoints: false,
        }
    }

    pub fn with_warmup_delay(mut self, delay: Duration) -> Self {
        self.warmup_delay = delay;
        self
    }

    pub fn with_process_delay(mut self, delay: Duration) -> Self {
        self.process_delay = delay;
        self
    }

    /// Fail the first `n` warmups with an error.
    pub fn failing_warmups(mut self, n: usize) -> Self {
        self.remaining_failures = Arc::new(AtomicUsize::new(n));
        self.failure_mode = WarmupFailure::Error;
        self
    }

    /// Panic during the first `n` warmups.
    pub fn panicking_warmups(mut self, n: usize) -> Self {
        self.remaining_failures = Arc::new(AtomicUsize::new(n));
        self.failure_mode = WarmupFailure::Panic;
        self
    }

    /// Make every `process` call fail with a processing error.
    pub fn rejecting_inputs(mut self) -> Self {
        self.reject_inputs = true;
        self
    }

    /// Add fractional `keypoints` coordinates derived from the content.
    pub fn with_keypoints(mut self) -> Self {
        self.keypoints = true;
        self
    }

    pub fn calls(&self) -> Arc<DetectorCalls> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl DetectorFactory for MockDetectorFactory {
    async fn construct(&self) -> Result<SharedDetector, DetectorError> {
        self.calls.constructs.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockDetector {
            config: self.clone(),
        }))
    }
}

struct MockDetector {
    config: MockDetectorFactory,
}

#[async_trait]
impl Detector for MockDetector {
    async fn warmup(&self) -> Result<(), DetectorError> {
        let config = &self.config;
        let attempt = config.calls.warmups.fetch_add(1, Ordering::SeqCst) + 1;
        if !config.warmup_delay.is_zero() {
            tokio::time::sleep(config.warmup_delay).await;
        }

        let fail = config
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        match (fail, config.failure_mode) {
            (false, _) => Ok(()),
            (true, WarmupFailure::Error) => Err(DetectorError::initialization(format!(
                "scripted warmup failure on attempt {}",
                attempt
            ))),
            (true, WarmupFailure::Panic) => panic!("scripted warmup panic on attempt {}", attempt),
        }
    }

    async fn process(&self, path: &Path) -> Result<DetectionResult, DetectorError> {
        let config = &self.config;
        config.calls.processed.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut paths) = config.calls.paths.lock() {
            paths.push(path.to_path_buf());
        }
        if !config.process_delay.is_zero() {
            tokio::time::sleep(config.process_delay).await;
        }

        let bytes = std::fs::read(path).map_err(|e| {
            DetectorError::processing(format!("cannot read {}: {}", path.display(), e))
        })?;
        if config.reject_inputs {
            return Err(DetectorError::processing("mock detector rejected input"));
        }

        let mut result = json!({
            "bytes": bytes.len(),
            "sha256": Fingerprint::of(&bytes).into_inner(),
        });
        if config.keypoints {
            result["keypoints"] = json!(mock_keypoints(&bytes));
        }
        Ok(result)
    }
}

/// Coordinates with long fractional parts, one pair per 8 bytes of content.
fn mock_keypoints(bytes: &[u8]) -> Vec<[f64; 2]> {
    bytes
        .chunks(8)
        .enumerate()
        .map(|(i, chunk)| {
            let seed = chunk.iter().fold(i as u64 + 1, |acc, b| {
                acc.wrapping_mul(31).wrapping_add(u64::from(*b))
            });
            let x = (seed % 10_000_019) as f64 / 1_000.3;
            let y = (seed % 7_000_003) as f64 / std::f64::consts::PI;
            [x, y]
        })
        .collect()
}

// ============================================================================
// MOCK STORES
// ============================================================================

/// Result store whose every operation fails as if the backend were down.
#[derive(Debug, Default)]
pub struct FailingResultStore {
    calls: AtomicUsize,
}

impl FailingResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail(&self) -> StorageError {
        self.calls.fetch_add(1, Ordering::SeqCst);
        StorageError::Unavailable {
            reason: "store offline".to_string(),
        }
    }
}

#[async_trait]
impl ResultStore for FailingResultStore {
    async fn append(&self, _record: NewAuditRecord) -> Result<AuditRecord, StorageError> {
        Err(self.fail())
    }

    async fn find_by_fingerprint(
        &self,
        _fingerprint: &Fingerprint,
    ) -> Result<Option<AuditRecord>, StorageError> {
        Err(self.fail())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Err(self.fail())
    }
}

// ============================================================================
// ENVIRONMENT
// ============================================================================

/// Sets or removes an environment variable and restores the previous value
/// on drop.
pub struct EnvVarGuard {
    key: &'static str,
    original: Option<String>,
}

impl EnvVarGuard {
    pub fn set(key: &'static str, value: &str) -> Self {
        let original = std::env::var(key).ok();
        std::env::set_var(key, value);
        Self { key, original }
    }

    pub fn unset(key: &'static str) -> Self {
        let original = std::env::var(key).ok();
        std::env::remove_var(key);
        Self { key, original }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match self.original.as_deref() {
            Some(v) => std::env::set_var(self.key, v),
            None => std::env::remove_var(self.key),
        }
    }
}

pub mod generators {
    //! Proptest strategies for uploads.

    use proptest::prelude::*;

    /// Arbitrary non-empty upload content.
    pub fn arb_upload_bytes() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(any::<u8>(), 1..2048)
    }

    /// Plausible client file names, some without an extension.
    pub fn arb_file_name() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z]{1,12}\\.(png|jpg|jpeg|gif|webp|bmp)",
            "[a-z]{1,12}",
            "[A-Za-z0-9 _-]{1,16}\\.[A-Z]{3}",
        ]
    }

    /// Text field values that are safe inside a multipart body.
    pub fn arb_text_value() -> impl Strategy<Value = String> {
        "[A-Za-z0-9 .,:;!?-]{0,64}"
    }
}

pub mod fixtures {
    //! Pre-built image bytes and multipart bodies.

    /// Boundary used by [`MultipartForm`].
    pub const BOUNDARY: &str = "keypoint-test-boundary-7MA4YWxkTrZu0gW";

    /// Minimal PNG: signature plus an IHDR chunk.
    pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&height.to_be_bytes());
        // bit depth, color type, compression, filter, interlace
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        // CRC is not validated by the probe
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes
    }

    /// Minimal GIF89a header with a logical screen descriptor.
    pub fn gif_bytes(width: u16, height: u16) -> Vec<u8> {
        let mut bytes = b"GIF89a".to_vec();
        bytes.extend_from_slice(&width.to_le_bytes());
        bytes.extend_from_slice(&height.to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 0, b';']);
        bytes
    }

    /// Minimal baseline JPEG: SOI, APP0, SOF0 and EOI markers.
    pub fn jpeg_bytes(width: u16, height: u16) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8];
        // APP0 / JFIF, length 16
        bytes.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        bytes.extend_from_slice(b"JFIF\0");
        bytes.extend_from_slice(&[1, 1, 0, 0, 1, 0, 1, 0, 0]);
        // SOF0, length 17, precision 8
        bytes.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        bytes.extend_from_slice(&height.to_be_bytes());
        bytes.extend_from_slice(&width.to_be_bytes());
        bytes.extend_from_slice(&[3, 1, 0x22, 0, 2, 0x11, 1, 3, 0x11, 1]);
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        bytes
    }

    enum Part {
        Text {
            name: String,
            value: String,
        },
        File {
            name: String,
            file_name: String,
            content_type: String,
            content: Vec<u8>,
        },
    }

    /// Builder for `multipart/form-data` request bodies.
    #[derive(Default)]
    pub struct MultipartForm {
        parts: Vec<Part>,
    }

    impl MultipartForm {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn text(mut self, name: &str, value: &str) -> Self {
            self.parts.push(Part::Text {
                name: name.to_string(),
                value: value.to_string(),
            });
            self
        }

        pub fn file(mut self, name: &str, file_name: &str, content_type: &str, content: &[u8]) -> Self {
            self.parts.push(Part::File {
                name: name.to_string(),
                file_name: file_name.to_string(),
                content_type: content_type.to_string(),
                content: content.to_vec(),
            });
            self
        }

        /// Value for the request's `Content-Type` header.
        pub fn content_type(&self) -> String {
            format!("multipart/form-data; boundary={}", BOUNDARY)
        }

        /// Encoded body.
        pub fn body(&self) -> Vec<u8> {
            let mut body = Vec::new();
            for part in &self.parts {
                body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
                match part {
                    Part::Text { name, value } => {
                        body.extend_from_slice(
                            format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                                .as_bytes(),
                        );
                        body.extend_from_slice(value.as_bytes());
                    }
                    Part::File {
                        name,
                        file_name,
                        content_type,
                        content,
                    } => {
                        body.extend_from_slice(
                            format!(
                                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                                name, file_name
                            )
                            .as_bytes(),
                        );
                        body.extend_from_slice(
                            format!("Content-Type: {}\r\n\r\n", content_type).as_bytes(),
                        );
                        body.extend_from_slice(content);
                    }
                }
                body.extend_from_slice(b"\r\n");
            }
            body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
            body
        }
    }

    /// Single-file form under field `file`, the shape `/process-image` expects.
    pub fn image_upload(file_name: &str, content: &[u8]) -> MultipartForm {
        MultipartForm::new().file("file", file_name, "application/octet-stream", content)
    }
}
