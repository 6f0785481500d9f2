//! Keyword classification of concept labels.
//!
//! A label is split into words and each vocabulary keyword is matched as a
//! case-insensitive word prefix ("malaria" matches "Malarial"). Vocabularies
//! are checked in precedence order, so "Malaria test" stays a condition.

use crate::model::RecordType;

/// One keyword vocabulary and the record type it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vocabulary {
    pub record_type: RecordType,
    /// Shown as the record's category
    pub name: &'static str,
    pub keywords: &'static [&'static str],
}

/// Vocabularies in precedence order.
pub const VOCABULARIES: [Vocabulary; 4] = [
    Vocabulary {
        record_type: RecordType::Condition,
        name: "Diagnosis",
        keywords: &[
            "diagnosis",
            "condition",
            "disease",
            "malaria",
            "smear",
            "fever",
            "pain",
            "infection",
            "impression",
            "problem",
        ],
    },
    Vocabulary {
        record_type: RecordType::Medication,
        name: "Medication",
        keywords: &[
            "medication",
            "drug",
            "prescription",
            "treatment",
            "dosage",
            "dose",
        ],
    },
    Vocabulary {
        record_type: RecordType::Test,
        name: "Laboratory",
        keywords: &[
            "lab",
            "laboratory",
            "test",
            "investigation",
            "result",
            "screening",
            "x-ray",
            "ultrasound",
            "scan",
        ],
    },
    Vocabulary {
        record_type: RecordType::Visit,
        name: "Visit",
        keywords: &["visit", "encounter", "admission", "discharge", "consultation"],
    },
];

/// Category used when no vocabulary matched.
pub const GENERAL_CATEGORY: &str = "General observation";

/// Outcome of classifying one concept label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub record_type: RecordType,
    pub category: &'static str,
    /// `None` when the label fell back to the default
    pub matched_keyword: Option<&'static str>,
}

/// Classify a concept label. Never fails: unknown labels become conditions.
#[must_use]
pub fn classify(concept_label: &str) -> Classification {
    let lowered = concept_label.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|w| !w.is_empty())
        .collect();

    for vocabulary in &VOCABULARIES {
        let hit = vocabulary
            .keywords
            .iter()
            .find(|keyword| words.iter().any(|word| word.starts_with(**keyword)));
        if let Some(keyword) = hit {
            return Classification {
                record_type: vocabulary.record_type,
                category: vocabulary.name,
                matched_keyword: Some(*keyword),
            };
        }
    }

    Classification {
        record_type: RecordType::Condition,
        category: GENERAL_CATEGORY,
        matched_keyword: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malarial_smear_is_condition() {
        let c = classify("Malarial smear");
        assert_eq!(c.record_type, RecordType::Condition);
        assert_eq!(c.category, "Diagnosis");
        assert_eq!(c.matched_keyword, Some("malaria"));
    }

    #[test]
    fn test_precedence_condition_over_test() {
        assert_eq!(classify("Malaria rapid test").record_type, RecordType::Condition);
    }

    #[test]
    fn test_medication_terms() {
        assert_eq!(classify("Drug order").record_type, RecordType::Medication);
        assert_eq!(classify("PRESCRIPTIONS").record_type, RecordType::Medication);
    }

    #[test]
    fn test_lab_and_visit_terms() {
        assert_eq!(classify("Chest X-ray").record_type, RecordType::Test);
        assert_eq!(classify("HIV screening").record_type, RecordType::Test);
        assert_eq!(classify("Laboratory results").category, "Laboratory");
        assert_eq!(classify("Visit note").record_type, RecordType::Visit);
        assert_eq!(classify("Discharge summary").record_type, RecordType::Visit);
    }

    #[test]
    fn test_match_is_word_prefix_not_substring() {
        // "lab" must not fire inside "syllabus"
        let c = classify("Syllabus");
        assert_eq!(c.matched_keyword, None);
    }

    #[test]
    fn test_unknown_label_defaults_to_condition() {
        let c = classify("Weight (kg)");
        assert_eq!(c.record_type, RecordType::Condition);
        assert_eq!(c.category, GENERAL_CATEGORY);
        assert_eq!(c.matched_keyword, None);
    }
}
