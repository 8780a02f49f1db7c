//! Detector contract
//!
//! The detector is the expensive, stateful engine behind `/process-image`.
//! It is constructed and warmed up once per process and then shared by all
//! requests. The actual feature-extraction algorithm is opaque here.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DetectorError;

/// Result produced by a detector. JSON is the canonical representation on
/// both the fresh and cached paths.
pub type DetectionResult = Value;

/// A ready detector shared across requests.
pub type SharedDetector = Arc<dyn Detector>;

/// A constructed detector.
#[async_trait]
pub trait Detector: Send + Sync + 'static {
    /// Prepare the detector for use. Called exactly once per successful
    /// initialization, before the detector is handed to any caller.
    async fn warmup(&self) -> Result<(), DetectorError>;

    /// Process the file at `path`.
    async fn process(&self, path: &Path) -> Result<DetectionResult, DetectorError>;
}

/// Builds detectors. Called once per initialization attempt.
#[async_trait]
pub trait DetectorFactory: Send + Sync + 'static {
    async fn construct(&self) -> Result<SharedDetector, DetectorError>;
}
