//! JSON-over-subprocess backends.
//!
//! Every verb is executed as `program [args] <verb> [verb args] --json` and the
//! helper answers with `{"success": bool, "data": ..., "error": "..."}` on
//! stdout. Captures travel as base64 PNG; model helpers read the PNG from stdin.

use super::{Capabilities, Connection, Detector, Recognizer, ScrollDirection};
use crate::error::BackendError;
use crate::vision::{Capture, RawDetection, RawTextBox, Rect};
use async_trait::async_trait;
use base64::Engine;
use image::RgbImage;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Remote desktop flavour a connection helper speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Vnc,
    Rdp,
    Local,
}

impl ConnectionKind {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let key = raw.trim().to_ascii_lowercase().replace('-', "_");
        match key.as_str() {
            "vnc" => Ok(Self::Vnc),
            "rdp" => Ok(Self::Rdp),
            "local" | "desktop" => Ok(Self::Local),
            _ => anyhow::bail!("Unsupported connection kind '{raw}'. Use 'vnc', 'rdp', or 'local'"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vnc => "vnc",
            Self::Rdp => "rdp",
            Self::Local => "local",
        }
    }
}

/// Reply from a helper invoked with `--json`.
#[derive(Debug, Deserialize)]
pub(crate) struct BridgeResponse {
    success: bool,
    data: Option<Value>,
    error: Option<String>,
}

impl BridgeResponse {
    fn into_data(self, op: &'static str) -> Result<Value, BackendError> {
        if self.success {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(BackendError::failed(
                op,
                self.error.unwrap_or_else(|| "helper reported failure".into()),
            ))
        }
    }
}

/// An external helper program.
#[derive(Debug, Clone)]
pub struct CommandBridge {
    program: String,
    args: Vec<String>,
}

impl CommandBridge {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Log form of one call. Verb arguments can carry typed text and the
    /// connection target, so only their count is kept.
    fn trace_label(&self, op: &str, verb_args: &[&str]) -> String {
        format!("{} {op} ({} args)", self.program, verb_args.len())
    }

    /// Runs one verb, optionally piping `stdin` to the helper.
    pub(crate) async fn run(
        &self,
        op: &'static str,
        verb_args: &[&str],
        stdin: Option<&[u8]>,
    ) -> Result<BridgeResponse, BackendError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).args(verb_args).arg("--json");
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running: {}", self.trace_label(op, verb_args));

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::failed(op, format!("failed to start {}: {e}", self.program)))?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !stderr.is_empty() {
            debug!("{} stderr: {}", self.program, stderr.trim());
        }

        if let Ok(resp) = serde_json::from_str::<BridgeResponse>(stdout.trim()) {
            return Ok(resp);
        }

        // Helpers without --json support still signal through the exit status.
        if output.status.success() {
            Ok(BridgeResponse {
                success: true,
                data: Some(json!({ "output": stdout.trim() })),
                error: None,
            })
        } else {
            Ok(BridgeResponse {
                success: false,
                data: None,
                error: Some(stderr.trim().to_string()),
            })
        }
    }

    async fn call(&self, op: &'static str, verb_args: &[&str], stdin: Option<&[u8]>) -> Result<Value, BackendError> {
        self.run(op, verb_args, stdin).await?.into_data(op)
    }
}

fn field<T: DeserializeOwned>(op: &'static str, data: &Value, key: &str) -> Result<T, BackendError> {
    let value = data
        .get(key)
        .cloned()
        .ok_or_else(|| BackendError::failed(op, format!("reply is missing '{key}'")))?;
    serde_json::from_value(value).map_err(|e| BackendError::failed(op, format!("bad '{key}': {e}")))
}

/// Desktop connection served by a helper such as a VNC or RDP client wrapper.
pub struct CommandConnection {
    bridge: CommandBridge,
    kind: ConnectionKind,
    target: String,
    capabilities: Capabilities,
    name: String,
}

impl CommandConnection {
    pub fn new(bridge: CommandBridge, kind: ConnectionKind, target: impl Into<String>, capabilities: Capabilities) -> Self {
        let target = target.into();
        let name = format!("{}:{}", kind.as_str(), target);
        Self {
            bridge,
            kind,
            target,
            capabilities,
            name,
        }
    }

    async fn call(&self, op: &'static str, verb: &str, extra: &[&str]) -> Result<Value, BackendError> {
        let mut args = vec!["--protocol", self.kind.as_str(), "--target", self.target.as_str(), verb];
        args.extend_from_slice(extra);
        self.bridge.call(op, &args, None).await
    }
}

#[async_trait]
impl Connection for CommandConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn capture(&mut self) -> Result<RgbImage, BackendError> {
        let data = self.call("capture", "capture", &[]).await?;
        let encoded: String = field("capture", &data, "png_base64")?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        let decoded = image::load_from_memory(&bytes).map_err(|e| BackendError::Decode(e.to_string()))?;
        Ok(decoded.to_rgb8())
    }

    async fn click(&mut self, x: i32, y: i32) -> Result<(), BackendError> {
        let (x, y) = (x.to_string(), y.to_string());
        self.call("click", "click", &[x.as_str(), y.as_str()]).await.map(|_| ())
    }

    async fn type_text(&mut self, text: &str) -> Result<(), BackendError> {
        debug!(chars = text.chars().count(), "Typing text");
        self.call("type", "type", &[text]).await.map(|_| ())
    }

    async fn scroll(&mut self, direction: ScrollDirection, amount: u32) -> Result<(), BackendError> {
        if !self.capabilities.can_scroll {
            return Err(BackendError::Unsupported("scroll"));
        }
        let amount = amount.to_string();
        self.call("scroll", "scroll", &[direction.as_str(), amount.as_str()])
            .await
            .map(|_| ())
    }

    async fn reconnect(&mut self) -> Result<(), BackendError> {
        if !self.capabilities.can_reconnect {
            return Err(BackendError::Unsupported("reconnect"));
        }
        self.call("reconnect", "reconnect", &[]).await.map(|_| ())
    }

    async fn disconnect(&mut self) -> Result<(), BackendError> {
        self.call("disconnect", "disconnect", &[]).await.map(|_| ())
    }
}

/// Detector helper: reads a PNG on stdin, replies `{"detections": [...]}`.
pub struct CommandDetector {
    bridge: CommandBridge,
}

impl CommandDetector {
    pub fn new(bridge: CommandBridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Detector for CommandDetector {
    async fn detect(&self, capture: &Capture) -> Result<Vec<RawDetection>, BackendError> {
        let png = capture.to_png()?;
        let data = self.bridge.call("detect", &["detect"], Some(&png)).await?;
        field("detect", &data, "detections")
    }
}

/// Recognizer helper: reads a PNG on stdin, replies `{"texts": [...]}`.
pub struct CommandRecognizer {
    bridge: CommandBridge,
}

impl CommandRecognizer {
    pub fn new(bridge: CommandBridge) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Recognizer for CommandRecognizer {
    async fn recognize(&self, capture: &Capture, region: Option<Rect>) -> Result<Vec<RawTextBox>, BackendError> {
        let png = capture.to_png()?;
        let region_arg = region.map(|r| format!("{},{},{},{}", r.x, r.y, r.width, r.height));
        let mut args = vec!["recognize"];
        if let Some(ref region) = region_arg {
            args.push("--region");
            args.push(region);
        }
        let data = self.bridge.call("recognize", &args, Some(&png)).await?;
        field("recognize", &data, "texts")
    }
}
