//! One automation session against one desktop.
//!
//! The session exclusively owns the connection. Every operation takes
//! `&mut self`, so there is never more than one action in flight, and the
//! breaker check happens in the same call that dispatches. Handing a session
//! to another agent moves the value.

mod action;
mod audit;

pub use action::{ActionKind, ActionLogEntry, GuiAction, Outcome, Target};
pub use audit::{AuditEvent, AuditSink, JsonAuditSink, SessionReport, SessionStats, SESSION_REPORT_TYPE};

use crate::backend::{with_timeout, Capabilities, Connection, Detector, Recognizer, ScrollDirection};
use crate::config::Config;
use crate::error::{BackendError, MalformedObservation, SessionError};
use crate::resolver::{ResolutionResult, Resolver, Surface};
use crate::safety::{BreakerState, PatientIdentifiers, SafetyGate, SafetyRecord};
use crate::verify::{ActionVerifier, VerificationResult};
use crate::vision::{Capture, CaptureSummary, Frame, FrameId, Observation, ObservationKind, Perception, Rect};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Normal,
    BreakerTripped,
    Aborted,
    ConnectionLost,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::BreakerTripped => "breaker_tripped",
            Self::Aborted => "aborted",
            Self::ConnectionLost => "connection_lost",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Terminated(TerminationReason),
}

/// Point-in-time view for tool callers and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub agent: String,
    pub connection: Option<String>,
    pub state: SessionState,
    pub breaker: BreakerState,
    pub healthcare: bool,
    pub patient_verified: bool,
    pub stats: SessionStats,
    pub visible_elements: usize,
}

const EVENT_CAPACITY: usize = 256;

enum Primitive<'a> {
    Capture,
    Click { x: i32, y: i32 },
    Type(&'a str),
    Scroll(ScrollDirection, u32),
}

impl Primitive<'_> {
    fn name(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Click { .. } => "click",
            Self::Type(_) => "type",
            Self::Scroll(..) => "scroll",
        }
    }
}

enum Dispatched {
    Image(RgbImage),
    Done,
}

async fn run_primitive(conn: &mut dyn Connection, op: &Primitive<'_>) -> Result<Dispatched, BackendError> {
    match op {
        Primitive::Capture => conn.capture().await.map(Dispatched::Image),
        Primitive::Click { x, y } => conn.click(*x, *y).await.map(|()| Dispatched::Done),
        Primitive::Type(text) => conn.type_text(text).await.map(|()| Dispatched::Done),
        Primitive::Scroll(direction, amount) => conn.scroll(*direction, *amount).await.map(|()| Dispatched::Done),
    }
}

pub struct Session {
    id: String,
    agent: String,
    config: Config,
    connection: Option<Box<dyn Connection>>,
    connection_name: String,
    capabilities: Capabilities,
    perception: Perception,
    resolver: Resolver,
    verifier: ActionVerifier,
    safety: SafetyGate,
    captures: VecDeque<Capture>,
    last_frame: Option<Frame>,
    next_frame: u64,
    action_log: Vec<ActionLogEntry>,
    patient: Option<PatientIdentifiers>,
    stats: SessionStats,
    state: SessionState,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    events: broadcast::Sender<AuditEvent>,
    audit: Arc<dyn AuditSink>,
}

impl Session {
    pub fn new(
        config: Config,
        connection: Box<dyn Connection>,
        detector: Arc<dyn Detector>,
        recognizer: Arc<dyn Recognizer>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let connection_name = connection.name().to_string();
        info!(
            session = %id,
            connection = %connection_name,
            healthcare = config.session.healthcare,
            "session started"
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            perception: Perception::new(detector, recognizer, &config.vision, config.action_timeout()),
            resolver: Resolver::new(&config.vision, &config.resolver),
            verifier: ActionVerifier::new(&config),
            safety: SafetyGate::new(&config.safety),
            capabilities: connection.capabilities(),
            connection: Some(connection),
            connection_name,
            id,
            agent: "default".into(),
            captures: VecDeque::with_capacity(config.session.capture_retention),
            last_frame: None,
            next_frame: 0,
            action_log: Vec::new(),
            patient: None,
            stats: SessionStats::default(),
            state: SessionState::Active,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            events,
            audit,
            config,
        }
    }

    #[must_use]
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn breaker(&self) -> BreakerState {
        self.safety.breaker()
    }

    pub fn action_log(&self) -> &[ActionLogEntry] {
        &self.action_log
    }

    pub fn safety_records(&self) -> &[SafetyRecord] {
        self.safety.records()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    /// Retained captures, oldest first.
    pub fn recent_captures(&self) -> Vec<CaptureSummary> {
        self.captures.iter().map(Capture::summary).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.events.subscribe()
    }

    /// Token that aborts the session from outside, e.g. on Ctrl-C.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Marks the session cancelled. The action in flight completes; the next one terminates.
    pub fn abort(&self) {
        info!(session = %self.id, "abort requested");
        self.cancel.cancel();
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            agent: self.agent.clone(),
            connection: self.connection.as_ref().map(|_| self.connection_name.clone()),
            state: self.state,
            breaker: self.safety.breaker(),
            healthcare: self.config.session.healthcare,
            patient_verified: self.safety.is_verified(),
            stats: self.stats.clone(),
            visible_elements: self.last_frame.as_ref().map_or(0, |f| f.elements.len()),
        }
    }

    /// Transfers the session to another agent. Nothing is copied.
    #[must_use]
    pub fn handoff(mut self, to: impl Into<String>) -> Self {
        let to = to.into();
        let from = std::mem::replace(&mut self.agent, to.clone());
        info!(session = %self.id, %from, %to, "session handed off");
        self.log(ActionKind::Handoff, format!("{from} -> {to}"), Outcome::Info);
        self
    }

    pub async fn resolve_element(&mut self, description: &str) -> Result<ResolutionResult, SessionError> {
        self.ensure_active().await?;
        let frame = self.capture_frame().await?;
        let resolver = self.resolver.clone();
        let result = resolver.resolve(description, &frame, self).await?;
        self.stats.resolutions += 1;
        let (detail, outcome) = match &result.element {
            Some(el) => (
                format!(
                    "'{description}' -> {} via {} ({} scrolls)",
                    el.display_name(),
                    result.strategy_used.as_str(),
                    result.scrolls
                ),
                Outcome::Success,
            ),
            None => (
                format!(
                    "'{description}' not found after {} strategy runs and {} scrolls",
                    result.strategies_tried.len(),
                    result.scrolls
                ),
                Outcome::Failure,
            ),
        };
        self.log(ActionKind::Resolve, detail, outcome);
        Ok(result)
    }

    /// Resolves the action's target, dispatches it, and verifies the effect.
    pub async fn perform_and_verify(
        &mut self,
        action: GuiAction,
        expected_outcome: &str,
    ) -> Result<VerificationResult, SessionError> {
        self.perform(action, expected_outcome, None).await
    }

    /// Like [`Session::perform_and_verify`], with at most `max_attempts`
    /// verification rounds instead of `verifier.max_attempts`.
    pub async fn perform_and_verify_with_attempts(
        &mut self,
        action: GuiAction,
        expected_outcome: &str,
        max_attempts: u32,
    ) -> Result<VerificationResult, SessionError> {
        self.perform(action, expected_outcome, Some(max_attempts)).await
    }

    async fn perform(
        &mut self,
        action: GuiAction,
        expected_outcome: &str,
        max_attempts: Option<u32>,
    ) -> Result<VerificationResult, SessionError> {
        self.ensure_active().await?;
        if self.config.session.healthcare && !self.safety.is_verified() {
            self.log(
                action.kind(),
                format!("{} refused: patient not verified", action.summary()),
                Outcome::Failure,
            );
            return Err(SessionError::PatientNotVerified);
        }

        let mut pre = self.capture_frame().await?;
        let (point, region) = match action.target() {
            Some(Target::Description(description)) => {
                let resolver = self.resolver.clone();
                let result = resolver.resolve(description, &pre, self).await?;
                self.stats.resolutions += 1;
                if result.scrolls > 0 {
                    if let Some(latest) = self.last_frame.clone() {
                        pre = latest;
                    }
                }
                let element = match result.into_element() {
                    Ok(element) => element,
                    Err(err) => {
                        self.log(action.kind(), format!("{} failed: {err}", action.summary()), Outcome::Failure);
                        return Err(err);
                    }
                };
                (
                    Some(element.click_point()),
                    Some(self.verifier.region_around(element.rect)),
                )
            }
            Some(Target::Point { x, y }) => (
                Some((*x, *y)),
                Some(self.verifier.region_around(Rect::new(*x, *y, 1, 1))),
            ),
            None => (None, None),
        };

        if let Err(err) = self.dispatch_action(&action, point).await {
            if self.is_active() {
                self.log(action.kind(), format!("{} failed: {err}", action.summary()), Outcome::Failure);
            }
            return Err(err);
        }
        self.stats.actions += 1;

        let post = self.capture_frame().await?;
        let verifier = match max_attempts {
            Some(attempts) => self.verifier.clone().with_max_attempts(attempts),
            None => self.verifier.clone(),
        };
        let result = verifier
            .verify(self, &pre.capture, post, expected_outcome, region)
            .await?;
        if !result.success {
            self.stats.verifications_failed += 1;
        }
        let at = point.map(|(x, y)| format!(" at ({x}, {y})")).unwrap_or_default();
        self.log(
            action.kind(),
            format!(
                "{}{at} -> {} after {} round(s)",
                action.summary(),
                result.reason.as_str(),
                result.attempts
            ),
            if result.success { Outcome::Success } else { Outcome::Failure },
        );
        Ok(result)
    }

    /// Reads the patient banner and checks it against `identifiers`. A failure
    /// trips the breaker and terminates the session.
    pub async fn verify_patient(&mut self, identifiers: &PatientIdentifiers) -> Result<SafetyRecord, SessionError> {
        self.ensure_active().await?;
        let capture = self.capture().await?;
        let region = self.safety.banner_rect(capture.width(), capture.height());
        let outcome = self
            .perception
            .read_region(&capture, region)
            .await
            .map_err(SessionError::Backend)?;
        self.log_discarded(&outcome.discarded);
        let texts = banner_texts(&outcome.observations);
        debug!(fragments = texts.len(), "banner text extracted");

        let mut record = self.safety.evaluate(identifiers, &texts);
        record.banner_capture_ref = Some(capture.reference());
        let record = self.safety.record(record).clone();
        self.patient = Some(identifiers.clone());
        let _ = self.events.send(AuditEvent::Safety(record.clone()));

        let names = |fields: &[crate::safety::IdentifierField]| {
            fields.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(",")
        };
        self.log(
            ActionKind::PatientCheck,
            format!(
                "{}/3 identifiers matched, {} required (matched: [{}], unmatched: [{}])",
                record.match_count,
                record.required,
                names(&record.matched_fields),
                names(&record.unmatched_fields)
            ),
            if record.passed { Outcome::Success } else { Outcome::Failure },
        );

        if record.passed {
            Ok(record)
        } else {
            self.shutdown(TerminationReason::BreakerTripped).await;
            Err(SessionError::SafetyVerificationFailure {
                match_count: record.match_count,
                required: record.required,
            })
        }
    }

    /// Ends the session: flushes the report, then releases the connection.
    pub async fn terminate(&mut self, reason: TerminationReason) -> Result<SessionReport, SessionError> {
        if let SessionState::Terminated(existing) = self.state {
            return Err(SessionError::Terminated(existing));
        }
        let outcome = if reason == TerminationReason::Normal {
            Outcome::Info
        } else {
            Outcome::Failure
        };
        self.log(ActionKind::Terminate, reason.as_str(), outcome);
        self.state = SessionState::Terminated(reason);

        let report = self.report(reason);
        let flushed = self.audit.flush(&report).await;
        if let Err(e) = &flushed {
            warn!(session = %self.id, error = %e, "failed to flush session report");
        }

        if let Some(mut conn) = self.connection.take() {
            if let Err(e) = with_timeout("disconnect", self.config.action_timeout(), conn.disconnect()).await {
                warn!(session = %self.id, error = %e, "disconnect failed");
            }
        }

        let _ = self.events.send(AuditEvent::Terminated {
            session_id: self.id.clone(),
            reason,
        });
        if reason == TerminationReason::Normal {
            info!(session = %self.id, "session terminated");
        } else {
            warn!(session = %self.id, reason = %reason, "session terminated");
        }
        flushed.map(|()| report)
    }

    /// Builds the report as it would be written now.
    pub fn report(&self, reason: TerminationReason) -> SessionReport {
        let keep = self.config.session.report_recent_captures;
        let skip = self.captures.len().saturating_sub(keep);
        let action_log = self
            .action_log
            .iter()
            .map(|entry| ActionLogEntry {
                detail: self.redact(&entry.detail),
                ..entry.clone()
            })
            .collect();
        SessionReport {
            schema_version: crate::REPORT_SCHEMA_VERSION,
            report_type: SESSION_REPORT_TYPE.into(),
            session_id: self.id.clone(),
            agent: self.agent.clone(),
            started_at: self.started_at,
            ended_at: Utc::now(),
            termination_reason: reason,
            breaker: self.safety.breaker(),
            stats: self.stats.clone(),
            action_log,
            safety_records: self.safety.records().to_vec(),
            recent_captures: self.captures.iter().skip(skip).map(Capture::summary).collect(),
        }
    }

    // ── internals ────────────────────────────────────────────────

    async fn ensure_active(&mut self) -> Result<(), SessionError> {
        if let SessionState::Terminated(reason) = self.state {
            return Err(SessionError::Terminated(reason));
        }
        if self.cancel.is_cancelled() {
            self.shutdown(TerminationReason::Aborted).await;
            return Err(SessionError::Terminated(TerminationReason::Aborted));
        }
        if self.safety.is_tripped() {
            self.shutdown(TerminationReason::BreakerTripped).await;
            return Err(SessionError::Terminated(TerminationReason::BreakerTripped));
        }
        Ok(())
    }

    async fn shutdown(&mut self, reason: TerminationReason) {
        if let Err(e) = self.terminate(reason).await {
            debug!(error = %e, "termination finished with error");
        }
    }

    fn redact(&self, text: &str) -> String {
        match &self.patient {
            Some(patient) if !self.safety.log_phi() => patient.redact(text),
            _ => text.to_string(),
        }
    }

    fn log(&mut self, kind: ActionKind, detail: impl Into<String>, outcome: Outcome) {
        let detail = self.redact(&detail.into());
        let entry = ActionLogEntry {
            seq: u64::try_from(self.action_log.len()).unwrap_or(u64::MAX).saturating_add(1),
            timestamp: Utc::now(),
            kind,
            detail,
            outcome,
        };
        debug!(seq = entry.seq, kind = ?entry.kind, outcome = ?entry.outcome, "{}", entry.detail);
        let _ = self.events.send(AuditEvent::Action(entry.clone()));
        self.action_log.push(entry);
    }

    /// Sends one primitive with bounded reconnects. Exhausting them ends the session.
    async fn dispatch(&mut self, op: Primitive<'_>) -> Result<Dispatched, SessionError> {
        let timeout = self.config.action_timeout();
        let mut reconnects_left = self.config.session.reconnect_attempts;
        loop {
            let Some(conn) = self.connection.as_mut() else {
                let reason = match self.state {
                    SessionState::Terminated(reason) => reason,
                    SessionState::Active => TerminationReason::ConnectionLost,
                };
                return Err(SessionError::Terminated(reason));
            };
            let err = match with_timeout(op.name(), timeout, run_primitive(conn.as_mut(), &op)).await {
                Ok(out) => return Ok(out),
                Err(e @ (BackendError::Unsupported(_) | BackendError::Decode(_))) => {
                    return Err(SessionError::Backend(e));
                }
                Err(e) => e,
            };

            warn!(op = op.name(), error = %err, reconnects_left, "connection call failed");
            if reconnects_left == 0 {
                self.log(
                    ActionKind::Reconnect,
                    format!("{} failed, reconnects exhausted: {err}", op.name()),
                    Outcome::Failure,
                );
                self.shutdown(TerminationReason::ConnectionLost).await;
                return Err(SessionError::Connection(err));
            }
            reconnects_left -= 1;

            let reconnected = match self.connection.as_mut() {
                Some(conn) => with_timeout("reconnect", timeout, conn.reconnect()).await,
                None => Err(BackendError::Unsupported("reconnect")),
            };
            match reconnected {
                Ok(()) => {
                    self.stats.reconnects += 1;
                    info!(session = %self.id, "reconnected");
                    self.log(
                        ActionKind::Reconnect,
                        format!("reconnected after {} failure", op.name()),
                        Outcome::Success,
                    );
                }
                Err(e) => {
                    warn!(error = %e, "reconnect failed");
                    self.log(ActionKind::Reconnect, format!("reconnect failed: {e}"), Outcome::Failure);
                }
            }
        }
    }

    async fn dispatch_action(&mut self, action: &GuiAction, point: Option<(i32, i32)>) -> Result<(), SessionError> {
        if let Some((x, y)) = point {
            self.dispatch(Primitive::Click { x, y }).await?;
        }
        match action {
            GuiAction::Click { .. } => {}
            GuiAction::Type { text, .. } => {
                self.dispatch(Primitive::Type(text)).await?;
            }
            GuiAction::Scroll { direction, amount } => {
                self.dispatch(Primitive::Scroll(*direction, *amount)).await?;
            }
        }
        Ok(())
    }

    async fn capture(&mut self) -> Result<Capture, SessionError> {
        let Dispatched::Image(image) = self.dispatch(Primitive::Capture).await? else {
            return Err(SessionError::Backend(BackendError::failed(
                "capture",
                "connection returned no image",
            )));
        };
        self.next_frame += 1;
        let capture = Capture::new(FrameId(self.next_frame), image);
        self.captures.push_back(capture.clone());
        while self.captures.len() > self.config.session.capture_retention.max(1) {
            self.captures.pop_front();
        }
        self.stats.captures += 1;
        Ok(capture)
    }

    async fn capture_frame(&mut self) -> Result<Frame, SessionError> {
        let capture = self.capture().await?;
        let frame = self
            .perception
            .analyze(capture)
            .await
            .map_err(SessionError::Backend)?;
        self.log_discarded(&frame.discarded);
        self.last_frame = Some(frame.clone());
        Ok(frame)
    }

    fn log_discarded(&mut self, discarded: &[MalformedObservation]) {
        for observation in discarded {
            self.log(ActionKind::ObservationDiscarded, observation.to_string(), Outcome::Info);
        }
        self.stats.discarded_observations += discarded.len() as u64;
    }
}

#[async_trait]
impl Surface for Session {
    fn can_scroll(&self) -> bool {
        self.capabilities.can_scroll
    }

    async fn scroll(&mut self, direction: ScrollDirection, amount: u32) -> Result<(), SessionError> {
        self.dispatch(Primitive::Scroll(direction, amount)).await?;
        self.log(
            ActionKind::Scroll,
            format!("scroll {} x{amount} while searching", direction.as_str()),
            Outcome::Info,
        );
        Ok(())
    }

    async fn refresh(&mut self) -> Result<Frame, SessionError> {
        self.capture_frame().await
    }
}

/// Text observations top to bottom, left to right.
fn banner_texts(observations: &[Observation]) -> Vec<String> {
    let mut texts: Vec<(&Observation, &str)> = observations
        .iter()
        .filter_map(|o| match &o.kind {
            ObservationKind::Text { text } => Some((o, text.as_str())),
            ObservationKind::Detection { .. } => None,
        })
        .collect();
    texts.sort_by_key(|(o, _)| (o.rect.y, o.rect.x));
    texts.into_iter().map(|(_, t)| t.to_string()).collect()
}
