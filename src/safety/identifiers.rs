//! Matching patient identifiers against OCR'd banner text.

use crate::resolver::contains_run;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierField {
    Name,
    Mrn,
    Dob,
}

impl IdentifierField {
    pub const ALL: [IdentifierField; 3] = [Self::Name, Self::Mrn, Self::Dob];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::Mrn => "mrn",
            Self::Dob => "dob",
        }
    }
}

/// Expected patient identity. `Debug` never prints the values.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct PatientIdentifiers {
    pub name: String,
    pub mrn: String,
    pub dob: String,
}

impl fmt::Debug for PatientIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatientIdentifiers")
            .field("name", &"[PATIENT_NAME]")
            .field("mrn", &"[PATIENT_MRN]")
            .field("dob", &"[PATIENT_DOB]")
            .finish()
    }
}

impl PatientIdentifiers {
    pub fn new(name: impl Into<String>, mrn: impl Into<String>, dob: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mrn: mrn.into(),
            dob: dob.into(),
        }
    }

    pub fn value(&self, field: IdentifierField) -> &str {
        match field {
            IdentifierField::Name => &self.name,
            IdentifierField::Mrn => &self.mrn,
            IdentifierField::Dob => &self.dob,
        }
    }

    /// Replaces every identifier occurring in `text` with a placeholder.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (value, placeholder) in [
            (&self.name, "[PATIENT_NAME]"),
            (&self.mrn, "[PATIENT_MRN]"),
            (&self.dob, "[PATIENT_DOB]"),
        ] {
            let value = value.trim();
            if !value.is_empty() {
                out = out.replace(value, placeholder);
            }
        }
        out
    }
}

static DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{1,4}\s*[./\-]\s*\d{1,2}\s*[./\-]\s*\d{1,4}").expect("date pattern is valid")
});
static DATE_PARTS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("digit pattern is valid"));

/// Uppercased banner text with collapsed whitespace.
#[derive(Debug, Clone)]
pub struct BannerText {
    joined: String,
    words: Vec<String>,
}

impl BannerText {
    pub fn new<S: AsRef<str>>(fragments: &[S]) -> Self {
        let joined = fragments
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(" ")
            .to_uppercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let words = name_tokens(&joined);
        Self { joined, words }
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty()
    }
}

fn name_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_uppercase)
        .collect()
}

fn canonical_date(raw: &str) -> Option<String> {
    let numbers: Vec<u32> = DATE_PARTS
        .find_iter(raw)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    (numbers.len() == 3).then(|| {
        numbers
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join("/")
    })
}

fn canonical_mrn(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_uppercase()
}

/// Field comparison rules.
#[derive(Debug, Clone, Copy)]
pub struct IdentifierMatcher {
    name_similarity: f64,
}

impl IdentifierMatcher {
    pub fn new(name_similarity: f64) -> Self {
        Self { name_similarity }
    }

    pub fn matches(&self, field: IdentifierField, expected: &str, banner: &BannerText) -> bool {
        let expected = expected.trim();
        if expected.is_empty() || banner.is_empty() {
            return false;
        }
        match field {
            IdentifierField::Name => self.name_matches(expected, banner),
            IdentifierField::Mrn => mrn_matches(expected, banner),
            IdentifierField::Dob => dob_matches(expected, banner),
        }
    }

    /// Whole-word run first, then similarity over contiguous word windows in
    /// either `FIRST LAST` or `LAST FIRST` order.
    fn name_matches(&self, expected: &str, banner: &BannerText) -> bool {
        let tokens = name_tokens(expected);
        if tokens.is_empty() {
            return false;
        }
        let mut reversed_tokens = tokens.clone();
        reversed_tokens.reverse();
        if contains_run(&banner.words, &tokens) || contains_run(&banner.words, &reversed_tokens) {
            return true;
        }
        let forward = tokens.join(" ");
        let reversed = reversed_tokens.join(" ");

        banner.words.windows(tokens.len()).any(|window| {
            let candidate = window.join(" ");
            strsim::normalized_levenshtein(&candidate, &forward) >= self.name_similarity
                || strsim::normalized_levenshtein(&candidate, &reversed) >= self.name_similarity
        })
    }
}

fn mrn_matches(expected: &str, banner: &BannerText) -> bool {
    let expected = canonical_mrn(expected);
    if expected.is_empty() {
        return false;
    }
    banner.joined.split_whitespace().any(|word| {
        let word = canonical_mrn(word);
        word == expected || word.strip_prefix("MRN") == Some(expected.as_str())
    })
}

fn dob_matches(expected: &str, banner: &BannerText) -> bool {
    let Some(expected) = canonical_date(expected) else {
        return false;
    };
    DATE.find_iter(&banner.joined)
        .filter_map(|m| canonical_date(m.as_str()))
        .any(|found| found == expected)
}
