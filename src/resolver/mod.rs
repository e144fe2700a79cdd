//! Maps a free-text element description onto one fused element.
//!
//! Strategies run in a fixed order and the first one that produces a
//! qualifying candidate wins. When nothing qualifies and the connection can
//! scroll, the resolver scrolls, asks for a fresh frame and runs the chain
//! again, up to `max_scroll_attempts` times.

mod matching;

pub(crate) use matching::{contains_run, Query};

use crate::backend::ScrollDirection;
use crate::config::{ResolverConfig, VisionConfig};
use crate::error::SessionError;
use crate::vision::{Frame, Role, UnifiedElement};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    ExactTextMatch,
    ClickableTypeMatch,
    FuzzyKeywordMatch,
    Exhausted,
}

impl Strategy {
    /// Matching strategies in the order they are tried.
    pub const CHAIN: [Strategy; 3] = [
        Strategy::ExactTextMatch,
        Strategy::ClickableTypeMatch,
        Strategy::FuzzyKeywordMatch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExactTextMatch => "exact_text_match",
            Self::ClickableTypeMatch => "clickable_type_match",
            Self::FuzzyKeywordMatch => "fuzzy_keyword_match",
            Self::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionResult {
    pub description: String,
    pub element: Option<UnifiedElement>,
    pub strategy_used: Strategy,
    /// Every strategy run, in order, across all fusion passes.
    pub strategies_tried: Vec<Strategy>,
    /// Fusion passes consulted (initial frame plus one per scroll).
    pub attempts: u32,
    pub scrolls: u32,
    pub confidence: f64,
    pub elapsed_ms: u64,
}

impl ResolutionResult {
    pub fn is_found(&self) -> bool {
        self.element.is_some()
    }

    /// Turns exhaustion into [`SessionError::ElementNotFound`].
    pub fn into_element(self) -> Result<UnifiedElement, SessionError> {
        match self.element {
            Some(element) => Ok(element),
            None => {
                let mut strategies = Vec::new();
                for s in self.strategies_tried {
                    if !strategies.contains(&s) {
                        strategies.push(s);
                    }
                }
                Err(SessionError::ElementNotFound {
                    description: self.description,
                    strategies,
                })
            }
        }
    }
}

/// A matched element and how it was found.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub element: UnifiedElement,
    pub strategy: Strategy,
    pub score: f64,
}

/// Something the resolver (and the verifier) can scroll and re-capture.
#[async_trait]
pub trait Surface: Send {
    fn can_scroll(&self) -> bool;

    async fn scroll(&mut self, direction: ScrollDirection, amount: u32) -> Result<(), SessionError>;

    /// Captures and fuses a new frame.
    async fn refresh(&mut self) -> Result<Frame, SessionError>;
}

#[derive(Debug, Clone)]
pub struct Resolver {
    min_confidence: f64,
    fuzzy_threshold: f64,
    max_scroll_attempts: u32,
    scroll_direction: ScrollDirection,
    scroll_amount: u32,
}

impl Resolver {
    pub fn new(vision: &VisionConfig, resolver: &ResolverConfig) -> Self {
        Self {
            min_confidence: vision.min_confidence,
            fuzzy_threshold: vision.fuzzy_threshold,
            max_scroll_attempts: resolver.max_scroll_attempts,
            scroll_direction: resolver.scroll_direction,
            scroll_amount: resolver.scroll_amount,
        }
    }

    /// Runs strategies 1-3 over one element set. `tried` records each strategy run.
    pub fn find(
        &self,
        description: &str,
        elements: &[UnifiedElement],
        tried: &mut Vec<Strategy>,
    ) -> Option<Candidate> {
        let query = Query::parse(description);
        for strategy in Strategy::CHAIN {
            tried.push(strategy);
            let best = match strategy {
                Strategy::ExactTextMatch => self.exact_text(&query, elements),
                Strategy::ClickableTypeMatch => self.role_hint(&query, elements),
                Strategy::FuzzyKeywordMatch => self.fuzzy_keyword(&query, elements),
                Strategy::Exhausted => None,
            };
            if let Some((score, element)) = best {
                debug!(
                    description,
                    strategy = strategy.as_str(),
                    element = %element.display_name(),
                    score,
                    "resolved element"
                );
                return Some(Candidate {
                    element: element.clone(),
                    strategy,
                    score,
                });
            }
            debug!(description, strategy = strategy.as_str(), "no candidate");
        }
        None
    }

    /// Resolution against a single frame, without scrolling.
    pub fn resolve_in_frame(&self, description: &str, frame: &Frame) -> ResolutionResult {
        self.resolve_elements(description, &frame.elements)
    }

    /// Resolution against an already fused element set, e.g. one loaded from disk.
    pub fn resolve_elements(&self, description: &str, elements: &[UnifiedElement]) -> ResolutionResult {
        let started = Instant::now();
        let mut tried = Vec::new();
        let found = self.find(description, elements, &mut tried);
        Self::result(description, found, tried, 1, 0, started)
    }

    /// Full resolution including scroll-and-retry through `surface`.
    pub async fn resolve(
        &self,
        description: &str,
        initial: &Frame,
        surface: &mut dyn Surface,
    ) -> Result<ResolutionResult, SessionError> {
        let started = Instant::now();
        let mut tried = Vec::new();
        let mut attempts = 1;
        let mut scrolls = 0;
        let mut found = self.find(description, &initial.elements, &mut tried);

        while found.is_none() && surface.can_scroll() && scrolls < self.max_scroll_attempts {
            surface
                .scroll(self.scroll_direction, self.scroll_amount)
                .await?;
            scrolls += 1;
            debug!(description, scrolls, "scrolled, re-capturing");
            let frame = surface.refresh().await?;
            attempts += 1;
            found = self.find(description, &frame.elements, &mut tried);
        }

        Ok(Self::result(description, found, tried, attempts, scrolls, started))
    }

    fn result(
        description: &str,
        found: Option<Candidate>,
        strategies_tried: Vec<Strategy>,
        attempts: u32,
        scrolls: u32,
        started: Instant,
    ) -> ResolutionResult {
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match found {
            Some(candidate) => ResolutionResult {
                description: description.to_string(),
                confidence: candidate.score,
                strategy_used: candidate.strategy,
                element: Some(candidate.element),
                strategies_tried,
                attempts,
                scrolls,
                elapsed_ms,
            },
            None => ResolutionResult {
                description: description.to_string(),
                element: None,
                strategy_used: Strategy::Exhausted,
                strategies_tried,
                attempts,
                scrolls,
                confidence: 0.0,
                elapsed_ms,
            },
        }
    }

    fn exact_text<'a>(&self, query: &Query, elements: &'a [UnifiedElement]) -> Option<(f64, &'a UnifiedElement)> {
        pick(elements.iter().filter_map(|el| {
            (el.text_confidence >= self.min_confidence && query.matches_text_exactly(&el.merged_text))
                .then_some((el.text_confidence, el))
        }))
    }

    fn role_hint<'a>(&self, query: &Query, elements: &'a [UnifiedElement]) -> Option<(f64, &'a UnifiedElement)> {
        let role = query.role_hint?;
        pick(elements.iter().filter_map(|el| {
            if el.role != role || el.confidence < self.min_confidence {
                return None;
            }
            let keyed = query.keywords.is_empty()
                || query.overlaps_keywords(&el.merged_text)
                || query.overlaps_keywords(&el.detected_label)
                || (role == Role::Input && has_matching_caption(query, el, elements));
            keyed.then_some((el.confidence, el))
        }))
    }

    fn fuzzy_keyword<'a>(&self, query: &Query, elements: &'a [UnifiedElement]) -> Option<(f64, &'a UnifiedElement)> {
        let core = query.core();
        pick(elements.iter().filter_map(|el| {
            let sim = matching::similarity(&core, &el.merged_text)
                .max(matching::similarity(&core, &el.detected_label));
            (sim >= self.fuzzy_threshold).then_some((sim * el.confidence, el))
        }))
    }
}

/// Unlabelled input fields are found through the text caption next to them.
fn has_matching_caption(query: &Query, field: &UnifiedElement, elements: &[UnifiedElement]) -> bool {
    elements.iter().any(|el| {
        el.role == Role::Text
            && query.overlaps_keywords(&el.merged_text)
            && matching::is_caption_of(&el.rect, &field.rect)
    })
}

fn pick<'a>(candidates: impl Iterator<Item = (f64, &'a UnifiedElement)>) -> Option<(f64, &'a UnifiedElement)> {
    candidates.fold(None, |best, candidate| match best {
        Some(current) if !matching::better(candidate, current) => Some(current),
        _ => Some(candidate),
    })
}
