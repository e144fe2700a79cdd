use crate::error::BackendError;
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::sync::Arc;

use super::geometry::Rect;

/// Monotonic capture number within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub u64);

/// One screen capture. Cheap to clone; the pixels are shared.
#[derive(Debug, Clone)]
pub struct Capture {
    pub id: FrameId,
    pub taken_at: DateTime<Utc>,
    image: Arc<RgbImage>,
    fingerprint: String,
}

impl Capture {
    pub fn new(id: FrameId, image: RgbImage) -> Self {
        let fingerprint = fingerprint(&image);
        Self {
            id,
            taken_at: Utc::now(),
            image: Arc::new(image),
            fingerprint,
        }
    }

    pub fn from_encoded(id: FrameId, bytes: &[u8]) -> Result<Self, BackendError> {
        let decoded =
            image::load_from_memory(bytes).map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(Self::new(id, decoded.to_rgb8()))
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn bounds(&self) -> Rect {
        Rect::new(
            0,
            0,
            i32::try_from(self.width()).unwrap_or(i32::MAX),
            i32::try_from(self.height()).unwrap_or(i32::MAX),
        )
    }

    /// Short content hash of the pixels.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Stable reference used as audit evidence.
    pub fn reference(&self) -> String {
        format!("frame-{}@{}", self.id.0, self.fingerprint)
    }

    pub fn to_png(&self) -> Result<Vec<u8>, BackendError> {
        let mut buf = Cursor::new(Vec::new());
        self.image
            .write_to(&mut buf, ImageFormat::Png)
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(buf.into_inner())
    }

    pub fn summary(&self) -> CaptureSummary {
        CaptureSummary {
            frame_id: self.id,
            reference: self.reference(),
            taken_at: self.taken_at,
            width: self.width(),
            height: self.height(),
        }
    }
}

/// Pixel-free description of a capture for reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSummary {
    pub frame_id: FrameId,
    pub reference: String,
    pub taken_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
}

fn fingerprint(image: &RgbImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.width().to_le_bytes());
    hasher.update(image.height().to_le_bytes());
    hasher.update(image.as_raw());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
