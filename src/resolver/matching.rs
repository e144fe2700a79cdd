//! Text scoring used by the resolution strategies.

use crate::vision::{Rect, Role, UnifiedElement};

/// Filler words that never identify an element.
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "on", "in", "into", "to", "of", "for", "at", "click", "press", "select",
    "tap", "open", "enter", "type", "with",
];

const CLICKABLE_HINTS: &[&str] = &["button", "link", "icon", "checkbox", "tab", "menu"];
const INPUT_HINTS: &[&str] = &["field", "input", "textbox", "box", "entry"];
const TEXT_HINTS: &[&str] = &["label", "text"];

/// Per-token similarity at which two words count as the same word.
const TOKEN_MATCH: f64 = 0.8;

/// Lowercase alphanumeric tokens.
pub(crate) fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

pub(crate) fn normalized(text: &str) -> String {
    tokens(text).join(" ")
}

pub(crate) fn contains_run(haystack: &[String], needle: &[String]) -> bool {
    !needle.is_empty()
        && needle.len() <= haystack.len()
        && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Parsed element description.
#[derive(Debug, Clone)]
pub(crate) struct Query {
    pub text: String,
    pub tokens: Vec<String>,
    pub role_hint: Option<Role>,
    /// Tokens left after removing filler and role-hint words.
    pub keywords: Vec<String>,
}

impl Query {
    pub fn parse(description: &str) -> Self {
        let tokens = tokens(description);
        let mut role_hint = None;
        let mut keywords = Vec::new();
        for token in &tokens {
            let hint = if CLICKABLE_HINTS.contains(&token.as_str()) {
                Some(Role::Clickable)
            } else if INPUT_HINTS.contains(&token.as_str()) {
                Some(Role::Input)
            } else if TEXT_HINTS.contains(&token.as_str()) {
                Some(Role::Text)
            } else {
                None
            };
            match hint {
                Some(role) => {
                    role_hint.get_or_insert(role);
                }
                None if !STOPWORDS.contains(&token.as_str()) => keywords.push(token.clone()),
                None => {}
            }
        }
        Self {
            text: tokens.join(" "),
            tokens,
            role_hint,
            keywords,
        }
    }

    /// What fuzzy matching compares against: keywords, or the whole query when none remain.
    pub fn core(&self) -> String {
        if self.keywords.is_empty() {
            self.text.clone()
        } else {
            self.keywords.join(" ")
        }
    }

    /// Description inside the element text, or the element text as a whole token run
    /// inside the description.
    pub fn matches_text_exactly(&self, merged_text: &str) -> bool {
        let element_tokens = tokens(merged_text);
        if element_tokens.is_empty() || self.tokens.is_empty() {
            return false;
        }
        let element_text = element_tokens.join(" ");
        element_text.contains(&self.text) || contains_run(&self.tokens, &element_tokens)
    }

    pub fn overlaps_keywords(&self, text: &str) -> bool {
        let candidate = tokens(text);
        self.keywords
            .iter()
            .any(|k| candidate.iter().any(|c| c == k || token_similarity(c, k) >= TOKEN_MATCH))
    }
}

fn token_similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

/// Mean best per-word similarity of `core` words against `candidate` words.
fn token_overlap(core: &[String], candidate: &[String]) -> f64 {
    if core.is_empty() || candidate.is_empty() {
        return 0.0;
    }
    let total: f64 = core
        .iter()
        .map(|word| {
            candidate
                .iter()
                .map(|c| token_similarity(word, c))
                .fold(0.0, f64::max)
        })
        .sum();
    total / core.len() as f64
}

/// Normalized similarity in `[0, 1]` between a query core and a candidate string.
pub(crate) fn similarity(core: &str, candidate: &str) -> f64 {
    let candidate_norm = normalized(candidate);
    if core.is_empty() || candidate_norm.is_empty() {
        return 0.0;
    }
    let whole = strsim::normalized_levenshtein(core, &candidate_norm);
    let core_tokens: Vec<String> = core.split(' ').map(str::to_string).collect();
    let candidate_tokens: Vec<String> = candidate_norm.split(' ').map(str::to_string).collect();
    whole.max(token_overlap(&core_tokens, &candidate_tokens))
}

/// Whether `label` reads as the caption of `field`: same row to its left, or directly above.
pub(crate) fn is_caption_of(label: &Rect, field: &Rect) -> bool {
    let (_, label_cy) = label.centroid();
    let (_, field_cy) = field.centroid();
    let same_row = (label_cy - field_cy).abs() <= f64::from(field.height) / 2.0
        && label.right() <= field.x + field.height
        && field.x - label.right() <= field.width.max(field.height * 4);
    let above = label.bottom() <= field.y + field.height / 4
        && field.y - label.bottom() <= field.height * 2
        && label.x < field.right()
        && label.right() > field.x;
    same_row || above
}

/// Candidate ordering: higher score, then smaller area, then lower id.
pub(crate) fn better(a: (f64, &UnifiedElement), b: (f64, &UnifiedElement)) -> bool {
    let (sa, ea) = a;
    let (sb, eb) = b;
    if (sa - sb).abs() > f64::EPSILON {
        return sa > sb;
    }
    match ea.rect.area().cmp(&eb.rect.area()) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => ea.id < eb.id,
    }
}
