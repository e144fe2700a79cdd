//! Merges detector boxes and recognized text into addressable UI elements.

use super::capture::FrameId;
use super::geometry::Rect;
use super::observation::{Observation, ObservationId, ObservationKind};
use crate::config::VisionConfig;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Clickable,
    Input,
    Text,
    Unknown,
}

const CLICKABLE_LABELS: &[&str] = &[
    "button", "btn", "link", "icon", "checkbox", "radio", "tab", "menu", "menuitem", "toggle",
    "switch",
];
const INPUT_LABELS: &[&str] = &[
    "input", "field", "textbox", "textfield", "entry", "combobox", "dropdown", "search", "textarea",
];

impl Role {
    /// Maps a detector class label onto an interaction role.
    pub fn from_label(label: &str) -> Self {
        let lower = label.to_ascii_lowercase();
        let tokens: Vec<&str> = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        let has = |set: &[&str]| tokens.iter().any(|t| set.contains(t));
        if has(INPUT_LABELS) {
            Self::Input
        } else if has(CLICKABLE_LABELS) {
            Self::Clickable
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clickable => "clickable",
            Self::Input => "input",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }

    fn specificity(self) -> u8 {
        match self {
            Self::Clickable | Self::Input => 2,
            Self::Unknown => 1,
            Self::Text => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub u32);

/// Fused representation of one interactive or readable screen region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedElement {
    pub id: ElementId,
    pub frame_id: FrameId,
    pub rect: Rect,
    pub merged_text: String,
    pub detected_label: String,
    /// Maximum confidence over every contributing observation.
    pub confidence: f64,
    /// Maximum confidence over contributing text observations, 0 when there are none.
    pub text_confidence: f64,
    pub role: Role,
    pub source_observation_ids: BTreeSet<ObservationId>,
}

impl UnifiedElement {
    pub fn click_point(&self) -> (i32, i32) {
        self.rect.center_point()
    }

    /// Short human-readable handle for logs and tool output.
    pub fn display_name(&self) -> String {
        match (self.merged_text.is_empty(), self.detected_label.is_empty()) {
            (false, false) => format!("{} '{}'", self.detected_label, self.merged_text),
            (false, true) => format!("'{}'", self.merged_text),
            (true, false) => self.detected_label.clone(),
            (true, true) => format!("element #{}", self.id.0),
        }
    }

    fn absorb(&mut self, other: UnifiedElement) {
        self.rect = self.rect.union(&other.rect);
        self.confidence = self.confidence.max(other.confidence);
        self.text_confidence = self.text_confidence.max(other.text_confidence);
        if other.role.specificity() > self.role.specificity() {
            self.role = other.role;
        }
        if self.detected_label.is_empty() {
            self.detected_label = other.detected_label;
        }
        self.source_observation_ids
            .extend(other.source_observation_ids);
    }
}

/// Spatial fusion of one capture's observations.
#[derive(Debug, Clone, Copy)]
pub struct FusionEngine {
    proximity_margin_pct: f64,
    dedupe_iou: f64,
}

impl FusionEngine {
    pub fn new(config: &VisionConfig) -> Self {
        Self {
            proximity_margin_pct: config.proximity_margin_pct,
            dedupe_iou: config.dedupe_iou,
        }
    }

    pub fn fuse(&self, observations: &[Observation]) -> Vec<UnifiedElement> {
        let detections: Vec<(&Observation, &str)> = observations
            .iter()
            .filter_map(|o| match &o.kind {
                ObservationKind::Detection { label } => Some((o, label.as_str())),
                ObservationKind::Text { .. } => None,
            })
            .collect();
        let texts: Vec<(&Observation, &str)> = observations
            .iter()
            .filter_map(|o| match &o.kind {
                ObservationKind::Text { text } => Some((o, text.as_str())),
                ObservationKind::Detection { .. } => None,
            })
            .collect();

        let mut absorbed: Vec<Vec<usize>> = vec![Vec::new(); detections.len()];
        let mut standalone = Vec::new();
        for (ti, (text_obs, _)) in texts.iter().enumerate() {
            match self.owning_detection(text_obs, &detections) {
                Some(di) => absorbed[di].push(ti),
                None => standalone.push(ti),
            }
        }

        let mut elements = Vec::with_capacity(detections.len() + standalone.len());
        for (di, (det, label)) in detections.iter().enumerate() {
            let members: Vec<(&Observation, &str)> = absorbed[di].iter().map(|&ti| texts[ti]).collect();
            elements.push(element_from_detection(det, label, &members, self.dedupe_iou));
        }
        for ti in standalone {
            let (obs, text) = texts[ti];
            elements.push(UnifiedElement {
                id: ElementId(0),
                frame_id: obs.frame_id,
                rect: obs.rect,
                merged_text: text.to_string(),
                detected_label: String::new(),
                confidence: obs.confidence,
                text_confidence: obs.confidence,
                role: Role::Text,
                source_observation_ids: BTreeSet::from([obs.id]),
            });
        }

        self.dedupe(elements)
    }

    /// Runs deduplication over an already fused set. A fused set comes back unchanged.
    pub fn refuse(&self, elements: &[UnifiedElement]) -> Vec<UnifiedElement> {
        self.dedupe(elements.to_vec())
    }

    /// Picks the detection that owns a text box: its margin-expanded rect must hold the
    /// text centroid; larger overlap wins, earlier detector order breaks ties.
    fn owning_detection(&self, text: &Observation, detections: &[(&Observation, &str)]) -> Option<usize> {
        let (cx, cy) = text.rect.centroid();
        let mut best: Option<(usize, i64)> = None;
        for (di, (det, _)) in detections.iter().enumerate() {
            let margin = self.proximity_margin_pct * f64::from(det.rect.width.min(det.rect.height));
            if !det.rect.expand(margin).contains_point(cx, cy) {
                continue;
            }
            let overlap = det.rect.intersection_area(&text.rect);
            match best {
                Some((_, best_overlap)) if overlap <= best_overlap => {}
                _ => best = Some((di, overlap)),
            }
        }
        best.map(|(di, _)| di)
    }

    fn dedupe(&self, mut elements: Vec<UnifiedElement>) -> Vec<UnifiedElement> {
        loop {
            let mut merged_any = false;
            let mut kept: Vec<UnifiedElement> = Vec::with_capacity(elements.len());
            for element in elements {
                let target = kept.iter_mut().find(|k| {
                    k.merged_text == element.merged_text && k.rect.iou(&element.rect) >= self.dedupe_iou
                });
                match target {
                    Some(existing) => {
                        existing.absorb(element);
                        merged_any = true;
                    }
                    None => kept.push(element),
                }
            }
            elements = kept;
            if !merged_any {
                break;
            }
        }

        for (index, element) in elements.iter_mut().enumerate() {
            element.id = ElementId(u32::try_from(index).unwrap_or(u32::MAX));
        }
        elements
    }
}

fn element_from_detection(
    det: &Observation,
    label: &str,
    members: &[(&Observation, &str)],
    duplicate_iou: f64,
) -> UnifiedElement {
    let mut rect = det.rect;
    let mut confidence = det.confidence;
    let mut text_confidence: f64 = 0.0;
    let mut sources = BTreeSet::from([det.id]);

    // OCR engines sometimes report the same word twice.
    let mut distinct: Vec<(&Observation, &str)> = Vec::with_capacity(members.len());
    for &(obs, text) in members {
        rect = rect.union(&obs.rect);
        confidence = confidence.max(obs.confidence);
        text_confidence = text_confidence.max(obs.confidence);
        sources.insert(obs.id);
        let duplicate = distinct
            .iter()
            .any(|(seen, seen_text)| *seen_text == text && seen.rect.iou(&obs.rect) >= duplicate_iou);
        if !duplicate {
            distinct.push((obs, text));
        }
    }

    UnifiedElement {
        id: ElementId(0),
        frame_id: det.frame_id,
        rect,
        merged_text: reading_order_text(distinct),
        detected_label: label.to_string(),
        confidence,
        text_confidence,
        role: Role::from_label(label),
        source_observation_ids: sources,
    }
}

/// Joins text boxes line by line, top to bottom, left to right within a line.
fn reading_order_text(mut texts: Vec<(&Observation, &str)>) -> String {
    if texts.is_empty() {
        return String::new();
    }
    texts.sort_by(|a, b| {
        let (ax, ay) = a.0.rect.centroid();
        let (bx, by) = b.0.rect.centroid();
        ay.partial_cmp(&by)
            .unwrap_or(Ordering::Equal)
            .then(ax.partial_cmp(&bx).unwrap_or(Ordering::Equal))
    });

    let mut lines: Vec<Vec<(&Observation, &str)>> = Vec::new();
    for entry in texts {
        let (_, cy) = entry.0.rect.centroid();
        let joins_last = lines.last().is_some_and(|line| {
            let anchor = line[0].0.rect;
            let tolerance = f64::from(anchor.height.min(entry.0.rect.height)) / 2.0;
            (cy - anchor.centroid().1).abs() <= tolerance
        });
        if joins_last {
            if let Some(line) = lines.last_mut() {
                line.push(entry);
            }
        } else {
            lines.push(vec![entry]);
        }
    }

    lines
        .into_iter()
        .flat_map(|mut line| {
            line.sort_by_key(|(obs, _)| obs.rect.x);
            line.into_iter().map(|(_, text)| text)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FusionEngine {
        FusionEngine::new(&VisionConfig::default())
    }

    fn text(id: u32, text: &str, rect: Rect, confidence: f64) -> Observation {
        Observation {
            id: ObservationId(id),
            frame_id: FrameId(1),
            kind: ObservationKind::Text { text: text.into() },
            rect,
            confidence,
        }
    }

    fn detection(id: u32, label: &str, rect: Rect, confidence: f64) -> Observation {
        Observation {
            id: ObservationId(id),
            frame_id: FrameId(1),
            kind: ObservationKind::Detection { label: label.into() },
            rect,
            confidence,
        }
    }

    fn submit_scene() -> Vec<Observation> {
        vec![
            detection(0, "button", Rect::new(5, 5, 65, 30), 0.8),
            text(1, "Submit", Rect::new(10, 10, 50, 20), 0.9),
        ]
    }

    #[test]
    fn empty_input_fuses_to_nothing() {
        assert!(engine().fuse(&[]).is_empty());
    }

    #[test]
    fn submit_text_inside_button_becomes_one_clickable_element() {
        let elements = engine().fuse(&submit_scene());
        assert_eq!(elements.len(), 1);
        let el = &elements[0];
        assert_eq!(el.merged_text, "Submit");
        assert_eq!(el.role, Role::Clickable);
        assert!((el.confidence - 0.9).abs() < 1e-9);
        assert_eq!(el.rect, Rect::new(5, 5, 65, 30));
        assert_eq!(el.source_observation_ids.len(), 2);
    }

    #[test]
    fn repeated_ocr_boxes_collapse_into_one_word() {
        let mut scene = submit_scene();
        scene.push(text(2, "Submit", Rect::new(10, 10, 50, 20), 0.9));
        scene.push(text(3, "Submit", Rect::new(11, 10, 50, 20), 0.85));
        let elements = engine().fuse(&scene);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].merged_text, "Submit");
        assert_eq!(elements[0].source_observation_ids.len(), 4);
    }

    #[test]
    fn unabsorbed_text_stands_alone() {
        let mut scene = submit_scene();
        scene.push(text(2, "Patient Chart", Rect::new(300, 10, 120, 20), 0.95));
        let elements = engine().fuse(&scene);
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[1].role, Role::Text);
        assert_eq!(elements[1].merged_text, "Patient Chart");
        assert!(elements[1].detected_label.is_empty());
    }

    #[test]
    fn text_within_margin_is_absorbed() {
        // Centroid at (72, 20): 2px right of the button edge, inside the 15% margin (4.5px).
        let scene = vec![
            detection(0, "button", Rect::new(5, 5, 65, 30), 0.8),
            text(1, "Go", Rect::new(66, 15, 12, 10), 0.9),
        ];
        let elements = engine().fuse(&scene);
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].merged_text, "Go");
    }

    #[test]
    fn overlapping_detections_prefer_larger_intersection() {
        let scene = vec![
            detection(0, "button", Rect::new(0, 0, 60, 40), 0.7),
            detection(1, "text_field", Rect::new(20, 0, 100, 40), 0.7),
            text(2, "Name", Rect::new(30, 10, 40, 20), 0.9),
        ];
        let elements = engine().fuse(&scene);
        assert_eq!(elements[0].merged_text, "");
        assert_eq!(elements[1].merged_text, "Name");
        assert_eq!(elements[1].role, Role::Input);
    }

    #[test]
    fn equal_overlap_goes_to_first_detection() {
        let scene = vec![
            detection(0, "button", Rect::new(0, 0, 50, 40), 0.6),
            detection(1, "link", Rect::new(0, 0, 50, 40), 0.6),
            text(2, "OK", Rect::new(10, 10, 20, 10), 0.9),
        ];
        let elements = engine().fuse(&scene);
        let ok = elements.iter().find(|e| e.merged_text == "OK").unwrap();
        assert!(ok.source_observation_ids.contains(&ObservationId(0)));
        assert_eq!(ok.detected_label, "button");
    }

    #[test]
    fn merged_text_follows_reading_order() {
        let scene = vec![
            detection(0, "panel", Rect::new(0, 0, 300, 100), 0.5),
            text(1, "Doe", Rect::new(100, 10, 40, 20), 0.9),
            text(2, "John", Rect::new(10, 12, 60, 20), 0.9),
            text(3, "MRN 123456", Rect::new(10, 60, 120, 20), 0.9),
        ];
        let elements = engine().fuse(&scene);
        assert_eq!(elements[0].merged_text, "John Doe MRN 123456");
        assert_eq!(elements[0].role, Role::Unknown);
    }

    #[test]
    fn duplicates_with_same_text_are_merged() {
        let scene = vec![
            text(0, "Save", Rect::new(0, 0, 40, 20), 0.7),
            text(1, "Save", Rect::new(2, 0, 40, 20), 0.8),
            text(2, "Cancel", Rect::new(2, 0, 40, 20), 0.8),
        ];
        let elements = engine().fuse(&scene);
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].merged_text, "Save");
        assert!((elements[0].confidence - 0.8).abs() < 1e-9);
        assert_eq!(elements[0].rect, Rect::new(0, 0, 42, 20));
    }

    #[test]
    fn fusion_is_idempotent() {
        let scene = vec![
            detection(0, "button", Rect::new(5, 5, 65, 30), 0.8),
            detection(1, "button", Rect::new(6, 5, 65, 30), 0.6),
            text(2, "Submit", Rect::new(10, 10, 50, 20), 0.9),
            text(3, "Submit", Rect::new(200, 10, 50, 20), 0.9),
            text(4, "Submit", Rect::new(201, 10, 50, 20), 0.7),
            detection(5, "text_field", Rect::new(0, 100, 200, 30), 0.75),
        ];
        let engine = engine();
        let once = engine.fuse(&scene);
        let twice = engine.refuse(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn confidence_never_drops_below_sources_or_exceeds_one() {
        let scene = vec![
            detection(0, "button", Rect::new(0, 0, 100, 40), 0.55),
            text(1, "Sign", Rect::new(5, 5, 30, 20), 0.65),
            text(2, "in", Rect::new(40, 5, 20, 20), 0.95),
            text(3, "Help", Rect::new(400, 5, 30, 20), 1.0),
        ];
        let by_id: std::collections::HashMap<ObservationId, f64> =
            scene.iter().map(|o| (o.id, o.confidence)).collect();
        for el in engine().fuse(&scene) {
            let max_source = el
                .source_observation_ids
                .iter()
                .map(|id| by_id[id])
                .fold(0.0, f64::max);
            assert!(el.confidence >= max_source);
            assert!(el.confidence <= 1.0);
        }
    }

    #[test]
    fn role_from_label_handles_separators() {
        assert_eq!(Role::from_label("Text-Field"), Role::Input);
        assert_eq!(Role::from_label("submit_button"), Role::Clickable);
        assert_eq!(Role::from_label("window"), Role::Unknown);
    }
}
