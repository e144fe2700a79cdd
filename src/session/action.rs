use crate::backend::ScrollDirection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where an action lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// Natural-language description, resolved against the current frame.
    Description(String),
    /// Absolute screen point.
    Point { x: i32, y: i32 },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Description(d) => write!(f, "'{d}'"),
            Self::Point { x, y } => write!(f, "({x}, {y})"),
        }
    }
}

/// A primitive GUI action the session can dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GuiAction {
    Click {
        target: Target,
    },
    /// Clicks `target` first when given, then types into whatever has focus.
    Type {
        #[serde(default)]
        target: Option<Target>,
        text: String,
    },
    Scroll {
        #[serde(default)]
        direction: ScrollDirection,
        #[serde(default = "default_scroll_amount")]
        amount: u32,
    },
}

fn default_scroll_amount() -> u32 {
    3
}

impl GuiAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Click { .. } => ActionKind::Click,
            Self::Type { .. } => ActionKind::Type,
            Self::Scroll { .. } => ActionKind::Scroll,
        }
    }

    pub fn target(&self) -> Option<&Target> {
        match self {
            Self::Click { target } => Some(target),
            Self::Type { target, .. } => target.as_ref(),
            Self::Scroll { .. } => None,
        }
    }

    /// One-line description for the action log. Typed text is reduced to its length.
    pub fn summary(&self) -> String {
        match self {
            Self::Click { target } => format!("click {target}"),
            Self::Type { target: Some(t), text } => format!("type {} chars into {t}", text.chars().count()),
            Self::Type { target: None, text } => format!("type {} chars", text.chars().count()),
            Self::Scroll { direction, amount } => format!("scroll {} x{amount}", direction.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Resolve,
    Click,
    Type,
    Scroll,
    PatientCheck,
    ObservationDiscarded,
    Reconnect,
    Handoff,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Info,
}

/// One append-only action log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: ActionKind,
    pub detail: String,
    pub outcome: Outcome,
}
