use super::capture::Capture;
use super::fusion::{FusionEngine, UnifiedElement};
use super::geometry::Rect;
use super::observation::{NormalizeOutcome, ObservationNormalizer};
use crate::backend::{with_timeout, Detector, Recognizer};
use crate::config::VisionConfig;
use crate::error::{BackendError, MalformedObservation};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One capture together with the elements fused from it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub capture: Capture,
    pub elements: Vec<UnifiedElement>,
    pub discarded: Vec<MalformedObservation>,
}

/// Detector + recognizer + normalizer + fusion for a single capture.
#[derive(Clone)]
pub struct Perception {
    detector: Arc<dyn Detector>,
    recognizer: Arc<dyn Recognizer>,
    normalizer: ObservationNormalizer,
    fusion: FusionEngine,
    timeout: Duration,
}

impl Perception {
    pub fn new(
        detector: Arc<dyn Detector>,
        recognizer: Arc<dyn Recognizer>,
        config: &VisionConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            detector,
            recognizer,
            normalizer: ObservationNormalizer::new(config.min_confidence),
            fusion: FusionEngine::new(config),
            timeout,
        }
    }

    /// Runs both models over the capture concurrently, then fuses once both finish.
    pub async fn analyze(&self, capture: Capture) -> Result<Frame, BackendError> {
        let (detections, texts) = tokio::join!(
            with_timeout("detect", self.timeout, self.detector.detect(&capture)),
            with_timeout(
                "recognize",
                self.timeout,
                self.recognizer.recognize(&capture, None)
            ),
        );
        let NormalizeOutcome {
            observations,
            discarded,
            ..
        } = self.normalizer.normalize(capture.id, &detections?, &texts?);
        let elements = self.fusion.fuse(&observations);
        debug!(
            frame = capture.id.0,
            elements = elements.len(),
            discarded = discarded.len(),
            "fused capture"
        );
        Ok(Frame {
            capture,
            elements,
            discarded,
        })
    }

    /// Text recognition restricted to `region`, without detection or fusion.
    pub async fn read_region(
        &self,
        capture: &Capture,
        region: Rect,
    ) -> Result<NormalizeOutcome, BackendError> {
        let texts = with_timeout(
            "recognize",
            self.timeout,
            self.recognizer.recognize(capture, Some(region)),
        )
        .await?;
        Ok(self.normalizer.normalize(capture.id, &[], &texts))
    }
}
