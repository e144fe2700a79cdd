//! Error taxonomy shared by the vision pipeline, the backends and the session.
//!
//! Only [`SessionError::SafetyVerificationFailure`] and an unrecoverable
//! [`SessionError::Connection`] end a session. Everything else is reported to
//! the caller as a typed value and the session stays usable.

use crate::resolver::Strategy;
use crate::session::TerminationReason;
use thiserror::Error;

/// A raw detector or recognizer box that could not be turned into an observation.
///
/// These never cross a component boundary as a failure: the normalizer drops
/// the box and hands the error back alongside the surviving observations.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed {source_kind} observation #{index}: {reason}")]
pub struct MalformedObservation {
    pub source_kind: &'static str,
    pub index: usize,
    pub reason: String,
}

/// Failures reported by an external collaborator (connection, detector, recognizer).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op} timed out after {after_ms} ms")]
    Timeout { op: &'static str, after_ms: u64 },

    #[error("{op} failed: {message}")]
    Failed { op: &'static str, message: String },

    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),

    #[error("failed to decode capture: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn failed(op: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            op,
            message: message.into(),
        }
    }
}

/// Errors surfaced by the operations a [`crate::Session`] exposes to its caller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no element matched '{description}' (tried: {})", format_strategies(.strategies))]
    ElementNotFound {
        description: String,
        strategies: Vec<Strategy>,
    },

    #[error("action outcome not confirmed after {attempts} attempts")]
    VerificationTimeout { attempts: u32 },

    /// The connection stayed broken through every reconnect attempt.
    #[error("connection lost: {0}")]
    Connection(#[source] BackendError),

    /// A model or connection call failed in a way that leaves the session usable.
    #[error("backend error: {0}")]
    Backend(#[source] BackendError),

    #[error("patient safety verification failed: {match_count} of {required} identifiers matched")]
    SafetyVerificationFailure { match_count: usize, required: usize },

    #[error("patient identity has not been verified for this session")]
    PatientNotVerified,

    #[error("session is terminated ({0})")]
    Terminated(TerminationReason),

    #[error("audit flush failed: {0}")]
    Audit(String),
}

impl SessionError {
    /// Whether this error ended the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SafetyVerificationFailure { .. } | Self::Connection(_) | Self::Terminated(_)
        )
    }
}

fn format_strategies(strategies: &[Strategy]) -> String {
    if strategies.is_empty() {
        return "none".into();
    }
    strategies
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
