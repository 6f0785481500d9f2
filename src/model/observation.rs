//! Source-side observation model.
//!
//! A [`SourceObservation`] is one clinical fact read from the hospital system,
//! already joined with its concept, subject, provider and location names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A person's name as recorded in the source system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameParts {
    pub given: String,
    pub middle: Option<String>,
    pub family: String,
}

impl NameParts {
    /// Build name parts, trimming each component and dropping an empty middle name.
    pub fn new(given: &str, middle: Option<&str>, family: &str) -> Self {
        Self {
            given: given.trim().to_string(),
            middle: middle
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from),
            family: family.trim().to_string(),
        }
    }

    /// Split a free-form display name ("Alice W. Mwangi (100-8)") into parts.
    ///
    /// Parenthesized suffixes (identifiers appended by OpenMRS) are dropped.
    /// The first word is the given name, the last word the family name, and
    /// anything between becomes the middle name.
    pub fn from_display(display: &str) -> Self {
        let mut cleaned = String::with_capacity(display.len());
        let mut depth = 0usize;
        for ch in display.chars() {
            match ch {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ if depth == 0 => cleaned.push(ch),
                _ => {}
            }
        }

        let words: Vec<&str> = cleaned.split_whitespace().collect();
        match words.as_slice() {
            [] => Self::default(),
            [only] => Self::new(only, None, ""),
            [first, middle @ .., last] => {
                let middle = middle.join(" ");
                Self::new(first, Some(middle.as_str()), last)
            }
        }
    }

    /// Full display name: given, middle and family joined by single spaces.
    #[must_use]
    pub fn full_name(&self) -> String {
        [Some(self.given.as_str()), self.middle.as_deref(), Some(self.family.as_str())]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// True when neither a given nor a family name is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.given.is_empty() && self.family.is_empty()
    }
}

/// The single value carried by an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ObservationValue {
    Text(String),
    Numeric(f64),
    Coded(String),
}

impl ObservationValue {
    /// Pick the populated value column in priority order: text, numeric, coded.
    ///
    /// Blank strings count as not populated.
    pub fn from_columns(
        text: Option<String>,
        numeric: Option<f64>,
        coded_display: Option<String>,
    ) -> Option<Self> {
        let non_blank = |s: Option<String>| {
            s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        };

        if let Some(text) = non_blank(text) {
            return Some(Self::Text(text));
        }
        if let Some(n) = numeric.filter(|n| n.is_finite()) {
            return Some(Self::Numeric(n));
        }
        non_blank(coded_display).map(Self::Coded)
    }

    /// Human-readable rendering used as the record's detail field.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Text(s) | Self::Coded(s) => s.clone(),
            // f64 Display already omits a trailing ".0"
            Self::Numeric(n) => n.to_string(),
        }
    }

    /// Storage name of the value column this came from.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Numeric(_) => "numeric",
            Self::Coded(_) => "coded",
        }
    }
}

/// One clinical observation from the source system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceObservation {
    /// Source-assigned identifier, never reused.
    pub source_observation_id: String,

    /// Source person identifier.
    pub subject_external_id: String,

    /// Subject's preferred name in the source system.
    pub subject_name: NameParts,

    /// National or other stable identifier, when the source has one.
    pub subject_national_id: Option<String>,

    /// Fully-specified concept name (what was measured or diagnosed).
    pub concept_label: String,

    /// `None` when no value column was populated.
    pub value: Option<ObservationValue>,

    /// Free-text clinician comment.
    pub comments: Option<String>,

    /// When the fact was clinically observed.
    pub recorded_at: DateTime<Utc>,

    /// When the row was written in the source system.
    pub captured_at: DateTime<Utc>,

    pub provider_name: Option<String>,
    pub location_name: Option<String>,
    pub encounter_ref: Option<String>,
}
