//! Patient identity gate.
//!
//! Before any action in a healthcare session, the banner at the top of the
//! chart is read and compared against the expected patient. At least two of
//! name, MRN and date of birth must match. The first failure trips a breaker
//! that stays tripped for the rest of the session.

mod identifiers;

pub use identifiers::{BannerText, IdentifierField, IdentifierMatcher, PatientIdentifiers};

use crate::config::{BannerRegion, SafetyConfig};
use crate::vision::Rect;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Outcome of one banner check. Raw identifiers are kept only with `log_phi`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_identifiers: Option<PatientIdentifiers>,
    pub matched_fields: Vec<IdentifierField>,
    pub unmatched_fields: Vec<IdentifierField>,
    pub match_count: usize,
    pub required: usize,
    pub passed: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner_capture_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerState {
    Armed,
    Tripped { at: DateTime<Utc> },
}

impl BreakerState {
    pub fn is_tripped(&self) -> bool {
        matches!(self, Self::Tripped { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Armed => "armed",
            Self::Tripped { .. } => "tripped",
        }
    }
}

#[derive(Debug)]
pub struct SafetyGate {
    min_matches: usize,
    banner_region: BannerRegion,
    log_phi: bool,
    matcher: IdentifierMatcher,
    breaker: BreakerState,
    records: Vec<SafetyRecord>,
}

impl SafetyGate {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            // Never below two, whatever the config says.
            min_matches: config.min_matches.clamp(2, IdentifierField::ALL.len()),
            banner_region: config.banner_region,
            log_phi: config.log_phi,
            matcher: IdentifierMatcher::new(config.name_similarity),
            breaker: BreakerState::Armed,
            records: Vec::new(),
        }
    }

    pub fn breaker(&self) -> BreakerState {
        self.breaker
    }

    pub fn is_tripped(&self) -> bool {
        self.breaker.is_tripped()
    }

    pub fn records(&self) -> &[SafetyRecord] {
        &self.records
    }

    pub fn min_matches(&self) -> usize {
        self.min_matches
    }

    pub fn log_phi(&self) -> bool {
        self.log_phi
    }

    /// Whether some check has passed and the breaker is still armed.
    pub fn is_verified(&self) -> bool {
        !self.is_tripped() && self.records.iter().any(|r| r.passed)
    }

    /// Banner rectangle on a `width` x `height` capture.
    pub fn banner_rect(&self, width: u32, height: u32) -> Rect {
        let scale = |pct: f64, total: u32| (pct / 100.0 * f64::from(total)).round() as i32;
        let r = &self.banner_region;
        Rect::new(
            scale(r.x_pct, width),
            scale(r.y_pct, height),
            scale(r.width_pct, width).max(1),
            scale(r.height_pct, height).max(1),
        )
    }

    /// Compares identifiers against banner text without touching gate state.
    pub fn evaluate<S: AsRef<str>>(&self, expected: &PatientIdentifiers, banner_texts: &[S]) -> SafetyRecord {
        let banner = BannerText::new(banner_texts);
        let (matched_fields, unmatched_fields): (Vec<_>, Vec<_>) = IdentifierField::ALL
            .into_iter()
            .partition(|&field| self.matcher.matches(field, expected.value(field), &banner));
        let match_count = matched_fields.len();
        SafetyRecord {
            expected_identifiers: self.log_phi.then(|| expected.clone()),
            matched_fields,
            unmatched_fields,
            match_count,
            required: self.min_matches,
            passed: match_count >= self.min_matches,
            timestamp: Utc::now(),
            banner_capture_ref: None,
        }
    }

    /// Appends a record and trips the breaker if it failed. Returns the stored record.
    pub fn record(&mut self, record: SafetyRecord) -> &SafetyRecord {
        if record.passed {
            info!(
                match_count = record.match_count,
                required = record.required,
                "patient identity verified"
            );
        } else {
            warn!(
                match_count = record.match_count,
                required = record.required,
                matched = ?record.matched_fields,
                unmatched = ?record.unmatched_fields,
                "patient identity check failed"
            );
            if !self.breaker.is_tripped() {
                self.breaker = BreakerState::Tripped {
                    at: record.timestamp,
                };
                warn!("safety breaker tripped; no further actions will be dispatched");
            }
        }
        if let Some(ids) = record.expected_identifiers.as_ref() {
            debug!(name = %ids.name, mrn = %ids.mrn, dob = %ids.dob, "checked identifiers");
        }
        self.records.push(record);
        let last = self.records.len() - 1;
        &self.records[last]
    }

    pub fn check<S: AsRef<str>>(&mut self, expected: &PatientIdentifiers, banner_texts: &[S]) -> &SafetyRecord {
        let record = self.evaluate(expected, banner_texts);
        self.record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn john_doe() -> PatientIdentifiers {
        PatientIdentifiers::new("John Doe", "123456", "01/01/1980")
    }

    fn gate() -> SafetyGate {
        SafetyGate::new(&SafetyConfig::default())
    }

    #[test]
    fn one_match_fails_and_trips_the_breaker() {
        let mut gate = gate();
        let record = gate
            .check(&john_doe(), &["JOHN DOE", "MRN 999999"])
            .clone();
        assert_eq!(record.match_count, 1);
        assert!(!record.passed);
        assert_eq!(record.matched_fields, vec![IdentifierField::Name]);
        assert_eq!(record.unmatched_fields, vec![IdentifierField::Mrn, IdentifierField::Dob]);
        assert!(gate.is_tripped());
        assert!(!gate.is_verified());
    }

    #[test]
    fn different_patient_sharing_a_birth_date_fails() {
        let expected = PatientIdentifiers::new("Ann Lee", "123456", "01/01/1980");
        let record = gate().evaluate(&expected, &["JOANN LEEDS", "MRN 777777", "DOB 01/01/1980"]);
        assert_eq!(record.matched_fields, vec![IdentifierField::Dob]);
        assert!(!record.passed);
    }

    #[test]
    fn two_of_three_pass() {
        let mut gate = gate();
        let record = gate.check(&john_doe(), &["DOE, JOHN", "MRN: 123456"]);
        assert!(record.passed);
        assert_eq!(record.match_count, 2);
        assert!(gate.is_verified());
        assert_eq!(gate.breaker(), BreakerState::Armed);
    }

    #[test]
    fn breaker_never_rearms() {
        let mut gate = gate();
        gate.check(&john_doe(), &["nothing useful"]);
        let tripped = gate.breaker();
        assert!(tripped.is_tripped());

        let record = gate.check(&john_doe(), &["JOHN DOE MRN 123456 DOB 01/01/1980"]);
        assert!(record.passed);
        assert_eq!(gate.breaker(), tripped);
        assert!(!gate.is_verified());
        assert_eq!(gate.records().len(), 2);
    }

    #[test]
    fn passed_iff_at_least_two_matches() {
        let gate = gate();
        let banners: [&[&str]; 6] = [
            &[],
            &["JOHN DOE"],
            &["123456"],
            &["JOHN DOE 123456"],
            &["01-01-1980 123456"],
            &["JOHN DOE 123456 1/1/1980"],
        ];
        for banner in banners {
            let record = gate.evaluate(&john_doe(), banner);
            assert!(record.match_count <= 3);
            assert_eq!(record.passed, record.match_count >= 2, "{banner:?}");
            assert_eq!(record.match_count + record.unmatched_fields.len(), 3);
        }
    }

    #[test]
    fn phi_is_only_retained_when_enabled() {
        let record = gate().evaluate(&john_doe(), &["JOHN DOE"]);
        assert!(record.expected_identifiers.is_none());
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("John"));

        let gate = SafetyGate::new(&SafetyConfig {
            log_phi: true,
            ..SafetyConfig::default()
        });
        let record = gate.evaluate(&john_doe(), &["JOHN DOE"]);
        assert_eq!(record.expected_identifiers, Some(john_doe()));
    }

    #[test]
    fn min_matches_can_be_raised_but_not_lowered() {
        let strict = SafetyGate::new(&SafetyConfig {
            min_matches: 3,
            ..SafetyConfig::default()
        });
        assert!(!strict.evaluate(&john_doe(), &["JOHN DOE 123456"]).passed);

        let lax = SafetyGate::new(&SafetyConfig {
            min_matches: 1,
            ..SafetyConfig::default()
        });
        assert_eq!(lax.min_matches(), 2);
    }

    #[test]
    fn banner_rect_is_top_fifth_by_default() {
        assert_eq!(gate().banner_rect(1920, 1080), Rect::new(0, 0, 1920, 216));
    }
}
