//! In-memory collaborators for unit tests.

use crate::backend::{Capabilities, Connection, Detector, Recognizer, ScrollDirection};
use crate::error::{BackendError, SessionError};
use crate::session::{AuditSink, SessionReport};
use crate::vision::{
    Capture, ElementId, Frame, FrameId, RawBox, RawDetection, RawTextBox, Rect, Role, UnifiedElement,
};
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

pub(crate) const SCREEN_WIDTH: u32 = 640;
pub(crate) const SCREEN_HEIGHT: u32 = 480;

pub(crate) fn gray(shade: u8) -> RgbImage {
    RgbImage::from_pixel(SCREEN_WIDTH, SCREEN_HEIGHT, Rgb([shade, shade, shade]))
}

pub(crate) fn blank_capture(id: FrameId) -> Capture {
    Capture::new(id, gray(255))
}

pub(crate) fn element(id: u32, text: &str, label: &str, rect: Rect, confidence: f64, role: Role) -> UnifiedElement {
    UnifiedElement {
        id: ElementId(id),
        frame_id: FrameId(1),
        rect,
        merged_text: text.to_string(),
        detected_label: label.to_string(),
        confidence,
        text_confidence: if text.is_empty() { 0.0 } else { confidence },
        role,
        source_observation_ids: BTreeSet::new(),
    }
}

pub(crate) fn frame_of(elements: Vec<UnifiedElement>) -> Frame {
    Frame {
        capture: blank_capture(FrameId(1)),
        elements,
        discarded: Vec::new(),
    }
}

fn xywh(rect: Rect) -> RawBox {
    RawBox::Xywh {
        x: f64::from(rect.x),
        y: f64::from(rect.y),
        w: f64::from(rect.width),
        h: f64::from(rect.height),
    }
}

pub(crate) fn det(label: &str, rect: Rect, confidence: f64) -> RawDetection {
    RawDetection {
        bbox: xywh(rect),
        label: label.to_string(),
        confidence,
    }
}

pub(crate) fn text_box(text: &str, rect: Rect, confidence: f64) -> RawTextBox {
    RawTextBox {
        bbox: xywh(rect),
        text: text.to_string(),
        confidence,
    }
}

/// Replays scripted outputs in order, then repeats the last one.
struct Script<T> {
    pending: VecDeque<T>,
    current: T,
}

impl<T: Clone> Script<T> {
    fn new(outputs: Vec<T>, empty: T) -> Self {
        Self {
            pending: outputs.into(),
            current: empty,
        }
    }

    fn next(&mut self) -> T {
        if let Some(next) = self.pending.pop_front() {
            self.current = next;
        }
        self.current.clone()
    }
}

pub(crate) struct StaticDetector {
    script: Mutex<Script<Vec<RawDetection>>>,
}

impl StaticDetector {
    pub(crate) fn new(detections: Vec<RawDetection>) -> Self {
        Self::sequence(vec![detections])
    }

    /// One detection list per call; the last one repeats.
    pub(crate) fn sequence(outputs: Vec<Vec<RawDetection>>) -> Self {
        Self {
            script: Mutex::new(Script::new(outputs, Vec::new())),
        }
    }
}

#[async_trait]
impl Detector for StaticDetector {
    async fn detect(&self, _capture: &Capture) -> Result<Vec<RawDetection>, BackendError> {
        Ok(self.script.lock().next())
    }
}

pub(crate) struct StaticRecognizer {
    script: Mutex<Script<Vec<RawTextBox>>>,
    regions: Arc<Mutex<Vec<Option<Rect>>>>,
}

impl StaticRecognizer {
    pub(crate) fn new(texts: Vec<RawTextBox>) -> Self {
        Self::sequence(vec![texts])
    }

    pub(crate) fn sequence(outputs: Vec<Vec<RawTextBox>>) -> Self {
        Self {
            script: Mutex::new(Script::new(outputs, Vec::new())),
            regions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every region the recognizer was asked to read.
    pub(crate) fn regions(&self) -> Arc<Mutex<Vec<Option<Rect>>>> {
        Arc::clone(&self.regions)
    }
}

#[async_trait]
impl Recognizer for StaticRecognizer {
    async fn recognize(&self, _capture: &Capture, region: Option<Rect>) -> Result<Vec<RawTextBox>, BackendError> {
        self.regions.lock().push(region);
        let texts = self.script.lock().next();
        let Some(region) = region else {
            return Ok(texts);
        };
        Ok(texts
            .into_iter()
            .filter(|t| {
                t.bbox.to_rect().is_ok_and(|r| {
                    let (cx, cy) = r.centroid();
                    region.contains_point(cx, cy)
                })
            })
            .collect())
    }
}

/// Connection that serves queued images and records every call.
pub(crate) struct ScriptedConnection {
    images: Script<RgbImage>,
    calls: Arc<Mutex<Vec<String>>>,
    capabilities: Capabilities,
    failing_captures: u32,
}

impl ScriptedConnection {
    pub(crate) fn new() -> Self {
        Self {
            images: Script::new(Vec::new(), gray(128)),
            calls: Arc::new(Mutex::new(Vec::new())),
            capabilities: Capabilities {
                can_scroll: true,
                can_reconnect: true,
            },
            failing_captures: 0,
        }
    }

    pub(crate) fn with_images(mut self, images: Vec<RgbImage>) -> Self {
        self.images = Script::new(images, gray(128));
        self
    }

    pub(crate) fn without_scroll(mut self) -> Self {
        self.capabilities.can_scroll = false;
        self
    }

    /// The next `count` captures fail.
    pub(crate) fn failing_captures(mut self, count: u32) -> Self {
        self.failing_captures = count;
        self
    }

    pub(crate) fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn capture(&mut self) -> Result<RgbImage, BackendError> {
        if self.failing_captures > 0 {
            self.failing_captures -= 1;
            self.record("capture!".into());
            return Err(BackendError::failed("capture", "socket closed"));
        }
        self.record("capture".into());
        Ok(self.images.next())
    }

    async fn click(&mut self, x: i32, y: i32) -> Result<(), BackendError> {
        self.record(format!("click {x},{y}"));
        Ok(())
    }

    async fn type_text(&mut self, text: &str) -> Result<(), BackendError> {
        self.record(format!("type {text}"));
        Ok(())
    }

    async fn scroll(&mut self, direction: ScrollDirection, amount: u32) -> Result<(), BackendError> {
        if !self.capabilities.can_scroll {
            return Err(BackendError::Unsupported("scroll"));
        }
        self.record(format!("scroll {} {amount}", direction.as_str()));
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), BackendError> {
        self.record("reconnect".into());
        if self.capabilities.can_reconnect {
            Ok(())
        } else {
            Err(BackendError::Unsupported("reconnect"))
        }
    }

    async fn disconnect(&mut self) -> Result<(), BackendError> {
        self.record("disconnect".into());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemorySink {
    reports: Arc<Mutex<Vec<SessionReport>>>,
}

impl MemorySink {
    pub(crate) fn reports(&self) -> Arc<Mutex<Vec<SessionReport>>> {
        Arc::clone(&self.reports)
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn flush(&self, report: &SessionReport) -> Result<(), SessionError> {
        self.reports.lock().push(report.clone());
        Ok(())
    }
}
