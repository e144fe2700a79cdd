//! Observation normalization, element fusion and the per-capture perception pass.

pub mod capture;
pub mod fusion;
pub mod geometry;
pub mod observation;
pub mod perception;

pub use capture::{Capture, CaptureSummary, FrameId};
pub use fusion::{ElementId, FusionEngine, Role, UnifiedElement};
pub use geometry::Rect;
pub use observation::{
    NormalizeOutcome, Observation, ObservationId, ObservationKind, ObservationNormalizer, RawBox,
    RawDetection, RawTextBox,
};
pub use perception::{Frame, Perception};
