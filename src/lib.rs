#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::doc_markdown,
    clippy::float_cmp,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

pub mod backend;
pub mod config;
pub mod error;
pub mod resolver;
pub mod safety;
pub mod session;
pub mod tools;
pub mod verify;
pub mod vision;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{BackendError, MalformedObservation, SessionError};
pub use resolver::{ResolutionResult, Resolver, Strategy};
pub use safety::{BreakerState, IdentifierField, PatientIdentifiers, SafetyGate, SafetyRecord};
pub use session::{GuiAction, Session, SessionReport, TerminationReason};
pub use verify::{ActionVerifier, VerificationReason, VerificationResult};
pub use vision::{FusionEngine, Observation, Rect, Role, UnifiedElement};

/// Version stamped into every JSON report emitted by the CLI and audit sink.
pub const REPORT_SCHEMA_VERSION: u32 = 1;
