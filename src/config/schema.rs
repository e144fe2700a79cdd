use crate::backend::ScrollDirection;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Config {
    /// Where this config was loaded from. Not serialized.
    #[serde(skip)]
    #[schemars(skip)]
    pub config_path: PathBuf,

    pub vision: VisionConfig,
    pub resolver: ResolverConfig,
    pub verifier: VerifierConfig,
    pub safety: SafetyConfig,
    pub session: SessionConfig,
    pub audit: AuditConfig,
    pub backend: BackendConfig,
    pub models: ModelsConfig,
}

// ── Vision ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct VisionConfig {
    /// Observations below this confidence are dropped before fusion.
    pub min_confidence: f64,
    /// Minimum normalized similarity for the fuzzy keyword strategy.
    pub fuzzy_threshold: f64,
    /// Detection boxes are grown by this fraction of their shorter side when
    /// deciding which text they contain.
    pub proximity_margin_pct: f64,
    /// IoU at which two elements with equal text are considered duplicates.
    pub dedupe_iou: f64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            fuzzy_threshold: 0.6,
            proximity_margin_pct: 0.15,
            dedupe_iou: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ResolverConfig {
    pub max_scroll_attempts: u32,
    pub scroll_direction: ScrollDirection,
    /// Scroll clicks per attempt.
    pub scroll_amount: u32,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_scroll_attempts: 3,
            scroll_direction: ScrollDirection::Down,
            scroll_amount: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct VerifierConfig {
    pub max_attempts: u32,
    /// First backoff interval; doubles every round.
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
    /// Fraction of changed pixels that counts as a visible reaction.
    pub min_change_ratio: f64,
    /// Luma difference above which a pixel counts as changed.
    pub pixel_delta_threshold: u8,
    /// Pixels added around the action's element when comparing captures.
    pub region_padding: u32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            backoff_max_ms: 4_000,
            min_change_ratio: 0.01,
            pixel_delta_threshold: 10,
            region_padding: 40,
        }
    }
}

// ── Patient safety ───────────────────────────────────────────────

/// Banner area as percentages of the capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BannerRegion {
    pub x_pct: f64,
    pub y_pct: f64,
    pub width_pct: f64,
    pub height_pct: f64,
}

impl Default for BannerRegion {
    fn default() -> Self {
        Self {
            x_pct: 0.0,
            y_pct: 0.0,
            width_pct: 100.0,
            height_pct: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SafetyConfig {
    /// Identifiers (of name, MRN, DOB) that must match. Only 2 or 3 are accepted.
    pub min_matches: usize,
    /// Token-window similarity at which an OCR'd name still counts as a match.
    pub name_similarity: f64,
    pub banner_region: BannerRegion,
    /// Keep raw patient identifiers in safety records and reports.
    pub log_phi: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_matches: 2,
            name_similarity: 0.85,
            banner_region: BannerRegion::default(),
            log_phi: false,
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionConfig {
    /// Refuse actions until the patient banner has been verified.
    pub healthcare: bool,
    pub capture_retention: usize,
    /// Upper bound for every single backend call.
    pub action_timeout_ms: u64,
    pub reconnect_attempts: u32,
    /// Capture references included in the termination report.
    pub report_recent_captures: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            healthcare: false,
            capture_retention: 10,
            action_timeout_ms: 30_000,
            reconnect_attempts: 2,
            report_recent_captures: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AuditConfig {
    /// Directory for session reports. `~` and `$VARS` are expanded.
    pub dir: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: "~/.vmpilot/session_logs".into(),
        }
    }
}

// ── External helpers ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BackendConfig {
    /// `vnc`, `rdp` or `local`.
    pub kind: String,
    pub program: String,
    pub args: Vec<String>,
    /// Host:port or display the helper connects to.
    pub target: String,
    pub can_scroll: bool,
    pub can_reconnect: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: "vnc".into(),
            program: "vmpilot-vnc".into(),
            args: Vec::new(),
            target: "localhost:5900".into(),
            can_scroll: true,
            can_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ModelsConfig {
    pub detector_program: String,
    pub detector_args: Vec<String>,
    pub recognizer_program: String,
    pub recognizer_args: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            detector_program: "vmpilot-detect".into(),
            detector_args: Vec::new(),
            recognizer_program: "vmpilot-ocr".into(),
            recognizer_args: Vec::new(),
        }
    }
}
