//! Built-in image format probe.
//!
//! The service's default [`Detector`]: identifies the container format of
//! an uploaded image from its magic bytes and reads the pixel dimensions
//! from the header. Deployments with a real feature extractor plug in
//! their own [`DetectorFactory`] instead.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use ::async_trait::async_trait;
use keypoint_core::{DetectionResult, Detector, DetectorError, DetectorFactory, SharedDetector};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
}

impl ImageFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Bmp => "image/bmp",
        }
    }
}

/// Result body for one probed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub format: ImageFormat,
    pub mime: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub bytes: usize,
}

struct Signature {
    format: ImageFormat,
    matches: fn(&[u8]) -> bool,
}

fn signature_table() -> Vec<Signature> {
    vec![
        Signature {
            format: ImageFormat::Png,
            matches: |b| b.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
        },
        Signature {
            format: ImageFormat::Jpeg,
            matches: |b| b.starts_with(&[0xFF, 0xD8, 0xFF]),
        },
        Signature {
            format: ImageFormat::Gif,
            matches: |b| b.starts_with(b"GIF87a") || b.starts_with(b"GIF89a"),
        },
        Signature {
            format: ImageFormat::Webp,
            matches: |b| b.len() >= 12 && &b[0..4] == b"RIFF" && &b[8..12] == b"WEBP",
        },
        Signature {
            format: ImageFormat::Bmp,
            matches: |b| b.starts_with(b"BM"),
        },
    ]
}

/// Detector that probes image headers.
#[derive(Default)]
pub struct FormatProbeDetector {
    signatures: OnceLock<Vec<Signature>>,
}

impl FormatProbeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe an in-memory image.
    pub fn probe(&self, bytes: &[u8]) -> Result<ProbeReport, DetectorError> {
        let signatures = self
            .signatures
            .get()
            .ok_or_else(|| DetectorError::processing("detector used before warmup"))?;

        let format = signatures
            .iter()
            .find(|sig| (sig.matches)(bytes))
            .map(|sig| sig.format)
            .ok_or_else(|| DetectorError::processing("unsupported image format"))?;

        let dimensions = match format {
            ImageFormat::Png => png_dimensions(bytes),
            ImageFormat::Jpeg => jpeg_dimensions(bytes),
            ImageFormat::Gif => gif_dimensions(bytes),
            ImageFormat::Webp => webp_dimensions(bytes),
            ImageFormat::Bmp => bmp_dimensions(bytes),
        };

        Ok(ProbeReport {
            format,
            mime: format.mime(),
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
            bytes: bytes.len(),
        })
    }
}

#[async_trait]
impl Detector for FormatProbeDetector {
    async fn warmup(&self) -> Result<(), DetectorError> {
        let table = self.signatures.get_or_init(signature_table);
        tracing::debug!(formats = table.len(), "Format probe warmed up");
        Ok(())
    }

    async fn process(&self, path: &Path) -> Result<DetectionResult, DetectorError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            DetectorError::processing(format!("cannot read {}: {}", path.display(), e))
        })?;
        let report = self.probe(&bytes)?;
        serde_json::to_value(report).map_err(|e| DetectorError::processing(e.to_string()))
    }
}

/// Factory for [`FormatProbeDetector`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatProbeFactory;

#[async_trait]
impl DetectorFactory for FormatProbeFactory {
    async fn construct(&self) -> Result<SharedDetector, DetectorError> {
        Ok(Arc::new(FormatProbeDetector::new()))
    }
}

// ============================================================================
// HEADER PARSING
// ============================================================================

fn be_u16(b: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*b.get(at)?, *b.get(at + 1)?]))
}

fn le_u16(b: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_le_bytes([*b.get(at)?, *b.get(at + 1)?]))
}

fn be_u32(b: &[u8], at: usize) -> Option<u32> {
    let s = b.get(at..at + 4)?;
    Some(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

fn le_i32(b: &[u8], at: usize) -> Option<i32> {
    let s = b.get(at..at + 4)?;
    Some(i32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

fn le_u24(b: &[u8], at: usize) -> Option<u32> {
    let s = b.get(at..at + 3)?;
    Some(u32::from(s[0]) | u32::from(s[1]) << 8 | u32::from(s[2]) << 16)
}

fn png_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    if b.get(12..16)? != b"IHDR" {
        return None;
    }
    Some((be_u32(b, 16)?, be_u32(b, 20)?))
}

fn gif_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    Some((u32::from(le_u16(b, 6)?), u32::from(le_u16(b, 8)?)))
}

fn bmp_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    let width = le_i32(b, 18)?;
    // Negative height marks a top-down bitmap.
    let height = le_i32(b, 22)?;
    Some((width.unsigned_abs(), height.unsigned_abs()))
}

fn webp_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    match b.get(12..16)? {
        b"VP8X" => Some((le_u24(b, 24)? + 1, le_u24(b, 27)? + 1)),
        b"VP8 " => Some((
            u32::from(le_u16(b, 26)? & 0x3FFF),
            u32::from(le_u16(b, 28)? & 0x3FFF),
        )),
        b"VP8L" => {
            let s = b.get(21..25)?;
            let (b0, b1, b2, b3) = (u32::from(s[0]), u32::from(s[1]), u32::from(s[2]), u32::from(s[3]));
            let width = 1 + (((b1 & 0x3F) << 8) | b0);
            let height = 1 + (((b3 & 0x0F) << 10) | (b2 << 2) | ((b1 & 0xC0) >> 6));
            Some((width, height))
        }
        _ => None,
    }
}

fn jpeg_dimensions(b: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 1 < b.len() {
        if b[i] != 0xFF {
            return None;
        }
        let marker = b[i + 1];
        match marker {
            // fill byte
            0xFF => i += 1,
            // standalone markers carry no length
            0x01 | 0xD0..=0xD9 => i += 2,
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                let height = be_u16(b, i + 5)?;
                let width = be_u16(b, i + 7)?;
                return Some((u32::from(width), u32::from(height)));
            }
            _ => i += 2 + usize::from(be_u16(b, i + 2)?),
        }
    }
    None
}
