//! Desktop GUI automation tool.
//!
//! Wraps one [`Session`] so an agent can resolve, act, verify and check the
//! patient banner through JSON calls. The session lock serializes calls, so a
//! tool shared between tasks still dispatches one action at a time.

use super::traits::{Tool, ToolResult};
use crate::backend::ScrollDirection;
use crate::error::SessionError;
use crate::safety::PatientIdentifiers;
use crate::session::{GuiAction, Session, Target};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

pub struct GuiTool {
    session: Mutex<Session>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ToolAction {
    ResolveElement { description: String },
    Perform {
        action: GuiAction,
        expected: String,
        max_attempts: Option<u32>,
    },
    VerifyPatient(PatientIdentifiers),
    Status,
}

impl GuiTool {
    pub fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
        }
    }

    /// Gives the session back, e.g. to hand it to another agent.
    pub fn into_session(self) -> Session {
        self.session.into_inner()
    }

    fn parse(args: &Value) -> anyhow::Result<ToolAction> {
        let str_arg = |key: &str| args.get(key).and_then(Value::as_str);
        let action_str = str_arg("action").ok_or_else(|| anyhow::anyhow!("Missing 'action' parameter"))?;
        let expected = str_arg("expected").unwrap_or_default().to_string();
        let max_attempts = args
            .get("max_attempts")
            .and_then(Value::as_u64)
            .map(u32::try_from)
            .transpose()?;

        let action = match action_str {
            "resolve_element" => ToolAction::ResolveElement {
                description: str_arg("description")
                    .ok_or_else(|| anyhow::anyhow!("Missing 'description' for resolve_element"))?
                    .into(),
            },
            "click" => ToolAction::Perform {
                action: GuiAction::Click {
                    target: parse_target(args)?
                        .ok_or_else(|| anyhow::anyhow!("click needs 'description' or 'x'/'y'"))?,
                },
                expected,
                max_attempts,
            },
            "type" => ToolAction::Perform {
                action: GuiAction::Type {
                    target: parse_target(args)?,
                    text: str_arg("text")
                        .ok_or_else(|| anyhow::anyhow!("Missing 'text' for type"))?
                        .into(),
                },
                expected,
                max_attempts,
            },
            "scroll" => {
                let direction = match str_arg("direction") {
                    Some(raw) => ScrollDirection::parse(raw)
                        .ok_or_else(|| anyhow::anyhow!("Unsupported scroll direction '{raw}'"))?,
                    None => ScrollDirection::default(),
                };
                let amount = args
                    .get("amount")
                    .and_then(Value::as_u64)
                    .map_or(3, |a| u32::try_from(a).unwrap_or(u32::MAX));
                ToolAction::Perform {
                    action: GuiAction::Scroll { direction, amount },
                    expected,
                    max_attempts,
                }
            }
            "verify_patient" => {
                let field = |key: &str| {
                    str_arg(key)
                        .map(str::to_string)
                        .ok_or_else(|| anyhow::anyhow!("Missing '{key}' for verify_patient"))
                };
                ToolAction::VerifyPatient(PatientIdentifiers::new(field("name")?, field("mrn")?, field("dob")?))
            }
            "status" => ToolAction::Status,
            other => anyhow::bail!("Unknown action '{other}'"),
        };
        Ok(action)
    }

    async fn run(&self, action: ToolAction) -> anyhow::Result<ToolResult> {
        let mut session = self.session.lock().await;
        let outcome = match action {
            ToolAction::ResolveElement { description } => session
                .resolve_element(&description)
                .await
                .map(|r| (r.is_found(), to_json(&r))),
            ToolAction::Perform {
                action,
                expected,
                max_attempts,
            } => match max_attempts {
                Some(attempts) => session.perform_and_verify_with_attempts(action, &expected, attempts).await,
                None => session.perform_and_verify(action, &expected).await,
            }
            .map(|r| (r.success, to_json(&r))),
            ToolAction::VerifyPatient(ids) => session
                .verify_patient(&ids)
                .await
                .map(|r| (r.passed, to_json(&r))),
            ToolAction::Status => Ok((true, to_json(&session.status()))),
        };
        Ok(match outcome {
            Ok((true, output)) => ToolResult::ok(output?),
            Ok((false, output)) => ToolResult::failed(output?, "Action completed without confirmation"),
            Err(err) => session_failure(&err),
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn parse_target(args: &Value) -> anyhow::Result<Option<Target>> {
    if let Some(description) = args.get("description").and_then(Value::as_str) {
        return Ok(Some(Target::Description(description.into())));
    }
    match (
        args.get("x").and_then(Value::as_i64),
        args.get("y").and_then(Value::as_i64),
    ) {
        (Some(x), Some(y)) => Ok(Some(Target::Point {
            x: i32::try_from(x)?,
            y: i32::try_from(y)?,
        })),
        (None, None) => Ok(None),
        _ => anyhow::bail!("Both 'x' and 'y' are required for a point target"),
    }
}

fn session_failure(err: &SessionError) -> ToolResult {
    let output = json!({ "fatal": err.is_fatal() }).to_string();
    ToolResult::failed(output, err.to_string())
}

#[async_trait]
impl Tool for GuiTool {
    fn name(&self) -> &str {
        "desktop_gui"
    }

    fn description(&self) -> &str {
        "Operate a remote desktop application through screenshots. Resolve on-screen \
        elements by natural-language description, click, type and scroll with automatic \
        verification, and confirm the patient banner before acting in clinical sessions."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["resolve_element", "click", "type", "scroll", "verify_patient", "status"],
                    "description": "GUI action to perform"
                },
                "description": {
                    "type": "string",
                    "description": "Natural-language element description, e.g. 'Submit button' or 'patient name field'"
                },
                "x": { "type": "integer", "description": "Absolute x coordinate, instead of 'description'" },
                "y": { "type": "integer", "description": "Absolute y coordinate, instead of 'description'" },
                "text": { "type": "string", "description": "Text to type" },
                "direction": {
                    "type": "string",
                    "enum": ["up", "down", "left", "right"],
                    "description": "Scroll direction"
                },
                "amount": { "type": "integer", "description": "Scroll clicks" },
                "expected": {
                    "type": "string",
                    "description": "Element or text expected on screen after the action"
                },
                "max_attempts": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Verification rounds for this action, overriding the configured default"
                },
                "name": { "type": "string", "description": "For verify_patient: patient name" },
                "mrn": { "type": "string", "description": "For verify_patient: medical record number" },
                "dob": { "type": "string", "description": "For verify_patient: date of birth" }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let action = Self::parse(&args)?;
        debug!(action = action_name(&action), "gui tool call");
        self.run(action).await
    }
}

fn action_name(action: &ToolAction) -> &'static str {
    match action {
        ToolAction::ResolveElement { .. } => "resolve_element",
        ToolAction::Perform { action, .. } => match action {
            GuiAction::Click { .. } => "click",
            GuiAction::Type { .. } => "type",
            GuiAction::Scroll { .. } => "scroll",
        },
        ToolAction::VerifyPatient(_) => "verify_patient",
        ToolAction::Status => "status",
    }
}
