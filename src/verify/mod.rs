//! Confirms that a dispatched action had an effect.

mod diff;

pub use diff::change_ratio;

use crate::config::Config;
use crate::error::SessionError;
use crate::resolver::{Resolver, Surface};
use crate::vision::{Capture, Frame, Rect};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationReason {
    ElementConfirmed,
    VisualChangeConfirmed,
    NoConfirmation,
}

impl VerificationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ElementConfirmed => "element_confirmed",
            Self::VisualChangeConfirmed => "visual_change_confirmed",
            Self::NoConfirmation => "no_confirmation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub pre_capture_ref: String,
    pub post_capture_ref: String,
    pub matched_text_or_element: Option<String>,
    /// Changed-pixel fraction from the last round compared.
    pub change_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub success: bool,
    pub reason: VerificationReason,
    pub confidence: f64,
    pub attempts: u32,
    pub evidence: Evidence,
}

impl VerificationResult {
    /// Turns `no_confirmation` into [`SessionError::VerificationTimeout`].
    pub fn into_result(self) -> Result<Self, SessionError> {
        if self.success {
            Ok(self)
        } else {
            Err(SessionError::VerificationTimeout {
                attempts: self.attempts,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionVerifier {
    resolver: Resolver,
    max_attempts: u32,
    backoff: Duration,
    backoff_max: Duration,
    min_change_ratio: f64,
    pixel_delta_threshold: u8,
    region_padding: u32,
}

impl ActionVerifier {
    pub fn new(config: &Config) -> Self {
        let v = &config.verifier;
        Self {
            resolver: Resolver::new(&config.vision, &config.resolver),
            max_attempts: v.max_attempts.max(1),
            backoff: Duration::from_millis(v.backoff_ms),
            backoff_max: Duration::from_millis(v.backoff_max_ms),
            min_change_ratio: v.min_change_ratio,
            pixel_delta_threshold: v.pixel_delta_threshold,
            region_padding: v.region_padding,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Comparison region for an action on `target`.
    pub fn region_around(&self, target: Rect) -> Rect {
        target.expand(f64::from(self.region_padding))
    }

    /// Wait before round `round + 1`.
    fn backoff_for(&self, round: u32) -> Duration {
        let factor = 2u32.saturating_pow(round);
        self.backoff.saturating_mul(factor).min(self.backoff_max)
    }

    /// One verification round against an already fused post frame.
    pub fn check(&self, pre: &Capture, post: &Frame, expected_outcome: &str, region: Option<Rect>) -> Round {
        if !expected_outcome.trim().is_empty() {
            let mut tried = Vec::new();
            if let Some(found) = self.resolver.find(expected_outcome, &post.elements, &mut tried) {
                return Round::Confirmed {
                    reason: VerificationReason::ElementConfirmed,
                    confidence: found.score,
                    matched: Some(found.element.display_name()),
                    change_ratio: 0.0,
                };
            }
        }

        let ratio = change_ratio(pre.image(), post.capture.image(), region, self.pixel_delta_threshold);
        if ratio > self.min_change_ratio {
            // 10% of the region changing is treated as certain.
            Round::Confirmed {
                reason: VerificationReason::VisualChangeConfirmed,
                confidence: (ratio * 10.0).min(1.0),
                matched: None,
                change_ratio: ratio,
            }
        } else {
            Round::Unconfirmed { change_ratio: ratio }
        }
    }

    /// Runs up to `max_attempts` rounds, re-capturing through `surface` between them.
    pub async fn verify(
        &self,
        surface: &mut dyn Surface,
        pre: &Capture,
        post: Frame,
        expected_outcome: &str,
        region: Option<Rect>,
    ) -> Result<VerificationResult, SessionError> {
        let mut post = post;
        let mut round = 0;
        loop {
            round += 1;
            let evidence = |matched, change_ratio, post: &Frame| Evidence {
                pre_capture_ref: pre.reference(),
                post_capture_ref: post.capture.reference(),
                matched_text_or_element: matched,
                change_ratio,
            };
            match self.check(pre, &post, expected_outcome, region) {
                Round::Confirmed {
                    reason,
                    confidence,
                    matched,
                    change_ratio,
                } => {
                    debug!(round, reason = reason.as_str(), confidence, "action confirmed");
                    return Ok(VerificationResult {
                        success: true,
                        reason,
                        confidence,
                        attempts: round,
                        evidence: evidence(matched, change_ratio, &post),
                    });
                }
                Round::Unconfirmed { change_ratio } if round >= self.max_attempts => {
                    debug!(round, change_ratio, "action not confirmed");
                    return Ok(VerificationResult {
                        success: false,
                        reason: VerificationReason::NoConfirmation,
                        confidence: 0.0,
                        attempts: round,
                        evidence: evidence(None, change_ratio, &post),
                    });
                }
                Round::Unconfirmed { change_ratio } => {
                    let wait = self.backoff_for(round - 1);
                    debug!(round, change_ratio, wait_ms = wait.as_millis(), "no change yet, backing off");
                    tokio::time::sleep(wait).await;
                    post = surface.refresh().await?;
                }
            }
        }
    }
}

/// Outcome of one verification round.
#[derive(Debug, Clone, PartialEq)]
pub enum Round {
    Confirmed {
        reason: VerificationReason,
        confidence: f64,
        matched: Option<String>,
        change_ratio: f64,
    },
    Unconfirmed {
        change_ratio: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScrollDirection;
    use crate::testing::element;
    use crate::vision::{FrameId, Role};
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;
    use tokio::time::Instant;

    fn capture(id: u64, shade: u8) -> Capture {
        Capture::new(FrameId(id), RgbImage::from_pixel(100, 100, Rgb([shade, shade, shade])))
    }

    fn frame(capture: Capture, elements: Vec<crate::vision::UnifiedElement>) -> Frame {
        Frame {
            capture,
            elements,
            discarded: Vec::new(),
        }
    }

    struct Refresher {
        frames: VecDeque<Frame>,
        refreshes: u32,
    }

    #[async_trait]
    impl Surface for Refresher {
        fn can_scroll(&self) -> bool {
            false
        }

        async fn scroll(&mut self, _direction: ScrollDirection, _amount: u32) -> Result<(), SessionError> {
            Ok(())
        }

        async fn refresh(&mut self) -> Result<Frame, SessionError> {
            self.refreshes += 1;
            Ok(self
                .frames
                .pop_front()
                .unwrap_or_else(|| frame(capture(99, 50), Vec::new())))
        }
    }

    fn verifier() -> ActionVerifier {
        ActionVerifier::new(&Config::default())
    }

    #[tokio::test(start_paused = true)]
    async fn identical_captures_exhaust_attempts() {
        let pre = capture(1, 50);
        let post = frame(capture(2, 50), Vec::new());
        let mut surface = Refresher {
            frames: VecDeque::new(),
            refreshes: 0,
        };
        let started = Instant::now();
        let result = verifier()
            .verify(&mut surface, &pre, post, "", None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.reason, VerificationReason::NoConfirmation);
        assert_eq!(result.attempts, 3);
        assert_eq!(surface.refreshes, 2);
        // 500 ms + 1000 ms of backoff between three rounds.
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
        assert!(matches!(
            result.into_result(),
            Err(SessionError::VerificationTimeout { attempts: 3 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_expected_outcome_on_identical_captures_fails() {
        let unrelated = || vec![element(0, "Cancel", "button", Rect::new(10, 10, 60, 20), 0.9, Role::Clickable)];
        let pre = capture(1, 50);
        let post = frame(capture(2, 50), unrelated());
        let mut surface = Refresher {
            frames: VecDeque::from([frame(capture(3, 50), unrelated()), frame(capture(4, 50), Vec::new())]),
            refreshes: 0,
        };
        let result = verifier()
            .verify(&mut surface, &pre, post, "order signed", Some(Rect::new(0, 0, 50, 50)))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.reason, VerificationReason::NoConfirmation);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.evidence.matched_text_or_element, None);
        assert_eq!(surface.refreshes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expected_element_confirms_immediately() {
        let pre = capture(1, 50);
        let post = frame(
            capture(2, 50),
            vec![element(0, "Order signed", "", Rect::new(10, 10, 120, 20), 0.9, Role::Text)],
        );
        let mut surface = Refresher {
            frames: VecDeque::new(),
            refreshes: 0,
        };
        let result = verifier()
            .verify(&mut surface, &pre, post, "order signed", None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.reason, VerificationReason::ElementConfirmed);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.evidence.matched_text_or_element.as_deref(), Some("'Order signed'"));
        assert_eq!(surface.refreshes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_visual_change_is_picked_up_after_backoff() {
        let pre = capture(1, 50);
        let post = frame(capture(2, 50), Vec::new());
        let mut surface = Refresher {
            frames: VecDeque::from([frame(capture(3, 200), Vec::new())]),
            refreshes: 0,
        };
        let result = verifier()
            .verify(&mut surface, &pre, post, "", Some(Rect::new(0, 0, 50, 50)))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.reason, VerificationReason::VisualChangeConfirmed);
        assert_eq!(result.attempts, 2);
        assert!((result.confidence - 1.0).abs() < 1e-9);
        assert_eq!(result.evidence.post_capture_ref, capture(3, 200).reference());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let v = verifier();
        assert_eq!(v.backoff_for(0), Duration::from_millis(500));
        assert_eq!(v.backoff_for(2), Duration::from_millis(2000));
        assert_eq!(v.backoff_for(5), Duration::from_millis(4000));
    }

    #[test]
    fn region_is_padded() {
        assert_eq!(
            verifier().region_around(Rect::new(100, 100, 20, 10)),
            Rect::new(60, 60, 100, 90)
        );
    }
}
