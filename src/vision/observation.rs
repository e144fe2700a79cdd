//! Raw model output and its canonical `Observation` form.

use super::capture::FrameId;
use super::geometry::Rect;
use crate::error::MalformedObservation;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Largest absolute coordinate accepted from a model. Keeps every derived
/// `Rect` sum well inside `i32`.
const MAX_COORDINATE: f64 = 1_048_576.0;

/// Box as reported by a model, in whatever convention that model uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum RawBox {
    /// Two corners.
    Xyxy { x1: f64, y1: f64, x2: f64, y2: f64 },
    /// Top-left corner plus size.
    Xywh { x: f64, y: f64, w: f64, h: f64 },
    /// Centre plus size (YOLO style).
    Cxcywh { cx: f64, cy: f64, w: f64, h: f64 },
    /// Corner points of a (possibly rotated) quadrilateral (OCR style).
    Polygon { points: Vec<[f64; 2]> },
}

impl RawBox {
    /// Converts to the canonical top-left/size rectangle.
    pub fn to_rect(&self) -> Result<Rect, String> {
        let (x1, y1, x2, y2) = match self {
            Self::Xyxy { x1, y1, x2, y2 } => (*x1, *y1, *x2, *y2),
            Self::Xywh { x, y, w, h } => (*x, *y, x + w, y + h),
            Self::Cxcywh { cx, cy, w, h } => (cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0),
            Self::Polygon { points } => {
                if points.len() < 3 {
                    return Err(format!("polygon needs at least 3 points, got {}", points.len()));
                }
                let xs = points.iter().map(|p| p[0]);
                let ys = points.iter().map(|p| p[1]);
                (
                    xs.clone().fold(f64::INFINITY, f64::min),
                    ys.clone().fold(f64::INFINITY, f64::min),
                    xs.fold(f64::NEG_INFINITY, f64::max),
                    ys.fold(f64::NEG_INFINITY, f64::max),
                )
            }
        };

        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return Err("non-finite coordinate".into());
        }
        if ![x1, y1, x2, y2].iter().all(|v| v.abs() <= MAX_COORDINATE) {
            return Err(format!("coordinate outside +/-{MAX_COORDINATE}"));
        }
        let (x1, y1, x2, y2) = (
            x1.round() as i32,
            y1.round() as i32,
            x2.round() as i32,
            y2.round() as i32,
        );
        let (width, height) = (x2 - x1, y2 - y1);
        if width <= 0 || height <= 0 {
            return Err(format!("non-positive size {width}x{height}"));
        }
        Ok(Rect::new(x1, y1, width, height))
    }
}

/// One box from the object detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(rename = "box")]
    pub bbox: RawBox,
    pub label: String,
    pub confidence: f64,
}

/// One box from the text recognizer, in absolute screen coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTextBox {
    #[serde(rename = "box")]
    pub bbox: RawBox,
    pub text: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObservationKind {
    Detection { label: String },
    Text { text: String },
}

/// A single normalized detector or recognizer output for one capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: ObservationId,
    pub frame_id: FrameId,
    #[serde(flatten)]
    pub kind: ObservationKind,
    pub rect: Rect,
    pub confidence: f64,
}

impl Observation {
    pub fn is_text(&self) -> bool {
        matches!(self.kind, ObservationKind::Text { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizeOutcome {
    pub observations: Vec<Observation>,
    /// Boxes rejected as malformed, in input order.
    pub discarded: Vec<MalformedObservation>,
    /// Well-formed boxes dropped for low confidence or blank text.
    pub filtered: usize,
}

/// Converts raw model output into canonical observations.
#[derive(Debug, Clone, Copy)]
pub struct ObservationNormalizer {
    min_confidence: f64,
}

impl ObservationNormalizer {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    /// Detections receive ids before text boxes, both in input order.
    pub fn normalize(
        &self,
        frame_id: FrameId,
        detections: &[RawDetection],
        texts: &[RawTextBox],
    ) -> NormalizeOutcome {
        let mut outcome = NormalizeOutcome::default();
        let mut next_id = 0u32;

        for (index, det) in detections.iter().enumerate() {
            let kind = ObservationKind::Detection {
                label: det.label.trim().to_string(),
            };
            self.push(&mut outcome, &mut next_id, frame_id, "detection", index, &det.bbox, det.confidence, kind);
        }

        for (index, text_box) in texts.iter().enumerate() {
            let text = text_box.text.trim();
            if text.is_empty() {
                outcome.filtered += 1;
                continue;
            }
            let kind = ObservationKind::Text { text: text.to_string() };
            self.push(&mut outcome, &mut next_id, frame_id, "text", index, &text_box.bbox, text_box.confidence, kind);
        }

        debug!(
            frame = frame_id.0,
            kept = outcome.observations.len(),
            discarded = outcome.discarded.len(),
            filtered = outcome.filtered,
            "normalized observations"
        );
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &self,
        outcome: &mut NormalizeOutcome,
        next_id: &mut u32,
        frame_id: FrameId,
        source_kind: &'static str,
        index: usize,
        bbox: &RawBox,
        confidence: f64,
        kind: ObservationKind,
    ) {
        let validated = validate_confidence(confidence).and_then(|()| bbox.to_rect());
        let rect = match validated {
            Ok(rect) => rect,
            Err(reason) => {
                let err = MalformedObservation {
                    source_kind,
                    index,
                    reason,
                };
                warn!(frame = frame_id.0, "discarding {err}");
                outcome.discarded.push(err);
                return;
            }
        };

        if confidence < self.min_confidence {
            outcome.filtered += 1;
            return;
        }

        outcome.observations.push(Observation {
            id: ObservationId(*next_id),
            frame_id,
            kind,
            rect,
            confidence,
        });
        *next_id += 1;
    }
}

fn validate_confidence(confidence: f64) -> Result<(), String> {
    if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(format!("confidence {confidence} outside [0, 1]"))
    }
}
