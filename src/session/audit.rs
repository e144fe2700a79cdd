//! Session reports and where they go.

use super::action::ActionLogEntry;
use super::TerminationReason;
use crate::error::SessionError;
use crate::safety::{BreakerState, SafetyRecord};
use crate::vision::CaptureSummary;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

pub const SESSION_REPORT_TYPE: &str = "session_report";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub captures: u64,
    pub resolutions: u64,
    pub actions: u64,
    pub verifications_failed: u64,
    pub discarded_observations: u64,
    pub reconnects: u32,
}

/// Written once, when the session terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub schema_version: u32,
    pub report_type: String,
    pub session_id: String,
    pub agent: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub termination_reason: TerminationReason,
    pub breaker: BreakerState,
    pub stats: SessionStats,
    pub action_log: Vec<ActionLogEntry>,
    pub safety_records: Vec<SafetyRecord>,
    pub recent_captures: Vec<CaptureSummary>,
}

/// Broadcast to observers as the session runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Action(ActionLogEntry),
    Safety(SafetyRecord),
    Terminated {
        session_id: String,
        reason: TerminationReason,
    },
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn flush(&self, report: &SessionReport) -> Result<(), SessionError>;
}

/// One pretty-printed JSON file per session under `dir`.
#[derive(Debug, Clone)]
pub struct JsonAuditSink {
    dir: PathBuf,
}

impl JsonAuditSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn report_path(&self, report: &SessionReport) -> PathBuf {
        self.dir.join(format!(
            "session_{}_{}.json",
            report.session_id,
            report.ended_at.format("%Y%m%d_%H%M%S")
        ))
    }
}

#[async_trait]
impl AuditSink for JsonAuditSink {
    async fn flush(&self, report: &SessionReport) -> Result<(), SessionError> {
        let audit = |e: std::io::Error| SessionError::Audit(e.to_string());
        tokio::fs::create_dir_all(&self.dir).await.map_err(audit)?;
        let body = serde_json::to_vec_pretty(report).map_err(|e| SessionError::Audit(e.to_string()))?;
        let path = self.report_path(report);
        tokio::fs::write(&path, body).await.map_err(audit)?;
        info!(path = %path.display(), "session report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> SessionReport {
        SessionReport {
            schema_version: crate::REPORT_SCHEMA_VERSION,
            report_type: SESSION_REPORT_TYPE.into(),
            session_id: "abc".into(),
            agent: "navigator".into(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            termination_reason: TerminationReason::Normal,
            breaker: BreakerState::Armed,
            stats: SessionStats::default(),
            action_log: Vec::new(),
            safety_records: Vec::new(),
            recent_captures: Vec::new(),
        }
    }

    #[tokio::test]
    async fn json_sink_writes_one_file_per_report() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = JsonAuditSink::new(tmp.path().join("logs"));
        let report = report();
        sink.flush(&report).await.unwrap();

        let path = sink.report_path(&report);
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["report_type"], "session_report");
        assert_eq!(value["termination_reason"], "normal");
        assert_eq!(value["breaker"]["state"], "armed");
    }
}
