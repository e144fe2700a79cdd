//! Seams to the outside world: the remote/local desktop connection and the two
//! vision models. Everything here is consumed through async traits so tests
//! can script them and production can plug in the command bridge.

pub mod command;

pub use command::{CommandBridge, CommandConnection, CommandDetector, CommandRecognizer, ConnectionKind};

use crate::error::BackendError;
use crate::vision::{Capture, RawDetection, RawTextBox, Rect};
use async_trait::async_trait;
use image::RgbImage;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

/// What a connection can do beyond capture/click/type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_scroll: bool,
    pub can_reconnect: bool,
}

/// A desktop the session drives. Owned exclusively by one session.
#[async_trait]
pub trait Connection: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn capture(&mut self) -> Result<RgbImage, BackendError>;

    async fn click(&mut self, x: i32, y: i32) -> Result<(), BackendError>;

    async fn type_text(&mut self, text: &str) -> Result<(), BackendError>;

    async fn scroll(&mut self, direction: ScrollDirection, amount: u32) -> Result<(), BackendError>;

    async fn reconnect(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("reconnect"))
    }

    async fn disconnect(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// UI element detector (YOLO-style boxes with class labels).
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, capture: &Capture) -> Result<Vec<RawDetection>, BackendError>;
}

/// Text recognizer. Returned boxes are in absolute screen coordinates even
/// when `region` restricts the read.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(
        &self,
        capture: &Capture,
        region: Option<Rect>,
    ) -> Result<Vec<RawTextBox>, BackendError>;
}

/// Bounds a backend call, mapping expiry onto [`BackendError::Timeout`].
pub(crate) async fn with_timeout<T>(
    op: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout {
            op,
            after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
