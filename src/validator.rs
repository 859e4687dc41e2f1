//! Field-level validation of parsed patient records
//!
//! The validator only annotates: records are never discarded. Every pass derives
//! the typed fields again from the raw cell text kept in [`SourceFields`], after
//! dropping the flags it owns, so validating twice gives the same record.
//!
//! [`SourceFields`]: crate::model::SourceFields

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ValidationConfig;
use crate::model::{Diagnosis, Gender, PatientRecord, RegisterBatch, ValidationFlag};
use crate::parser::parse_age;
use crate::vocabulary::{DiagnosisMatch, MedicalVocabulary};

/// Applies age, gender, diagnosis and consistency rules to records
#[derive(Debug, Clone)]
pub struct RecordValidator {
    config: ValidationConfig,
    vocabulary: Arc<MedicalVocabulary>,
}

impl RecordValidator {
    pub fn new(config: ValidationConfig, vocabulary: Arc<MedicalVocabulary>) -> Self {
        Self { config, vocabulary }
    }

    /// Validate one record, returning the validated copy and its validator flags.
    ///
    /// # Examples
    /// ```
    /// use std::sync::Arc;
    /// use register_extract::config::ValidationConfig;
    /// use register_extract::model::{Diagnosis, Gender, PatientRecord, ValidationFlag};
    /// use register_extract::validator::RecordValidator;
    /// use register_extract::vocabulary::MedicalVocabulary;
    ///
    /// let validator = RecordValidator::new(
    ///     ValidationConfig::default(),
    ///     Arc::new(MedicalVocabulary::builtin()),
    /// );
    /// let mut record = PatientRecord::new(0, 0.9);
    /// record.source.age = Some("140".to_string());
    /// record.source.gender = Some("Homme".to_string());
    /// record.source.diagnosis = Some("HTA".to_string());
    ///
    /// let (validated, flags) = validator.validate(&record);
    /// assert_eq!(validated.age, None);
    /// assert_eq!(validated.gender, Gender::M);
    /// assert_eq!(validated.diagnosis, Diagnosis::Canonical("Hypertension".to_string()));
    /// assert_eq!(flags, vec![ValidationFlag::InvalidAge]);
    /// ```
    pub fn validate(&self, record: &PatientRecord) -> (PatientRecord, Vec<ValidationFlag>) {
        let mut validated = record.clone();
        self.validate_in_place(&mut validated);
        let flags = validated
            .flags
            .iter()
            .filter(|flag| flag.is_validator_flag())
            .cloned()
            .collect();
        (validated, flags)
    }

    pub fn validate_in_place(&self, record: &mut PatientRecord) {
        record.flags.retain(|flag| !flag.is_validator_flag());

        self.apply_age(record);
        self.apply_gender(record);
        self.apply_diagnosis(record);

        if record.source_confidence < self.config.low_confidence_threshold {
            record.flags.insert(ValidationFlag::LowConfidence);
        }

        if let Some(restriction) = record
            .diagnosis
            .canonical()
            .and_then(|name| self.vocabulary.gender_restriction(name))
        {
            if record.gender != Gender::Unknown && record.gender != restriction {
                debug!(
                    record_id = %record.record_id,
                    diagnosis = record.diagnosis.display_text(),
                    gender = %record.gender,
                    "Diagnosis contradicts recorded gender"
                );
                record.flags.insert(ValidationFlag::ContradictoryFields);
            }
        }
    }

    /// Validate every record of a batch; returns how many records carry validator flags
    pub fn validate_batch(&self, batch: &mut RegisterBatch) -> usize {
        for record in &mut batch.records {
            self.validate_in_place(record);
        }
        let flagged = batch
            .records
            .iter()
            .filter(|r| r.flags.iter().any(ValidationFlag::is_validator_flag))
            .count();
        info!(
            "Validated {} records, {} with field issues",
            batch.records.len(),
            flagged
        );
        flagged
    }

    fn apply_age(&self, record: &mut PatientRecord) {
        let candidate = match record.source.age.as_deref() {
            Some(text) => match parse_age(text) {
                Some(age) => Some(age),
                None => {
                    record.age = None;
                    record.flags.insert(ValidationFlag::InvalidAge);
                    return;
                }
            },
            None => record.age,
        };

        match candidate {
            Some(age) if age > self.config.max_age => {
                // Keep the rejected value so later passes reach the same verdict
                record.source.age.get_or_insert_with(|| age.to_string());
                record.age = None;
                record.flags.insert(ValidationFlag::InvalidAge);
            }
            other => record.age = other,
        }
    }

    fn apply_gender(&self, record: &mut PatientRecord) {
        let Some(text) = record.source.gender.as_deref() else {
            return;
        };
        match self.vocabulary.gender_for(text) {
            Some(gender) => record.gender = gender,
            None => {
                record.gender = Gender::Unknown;
                record.flags.insert(ValidationFlag::InvalidGender);
            }
        }
    }

    fn apply_diagnosis(&self, record: &mut PatientRecord) {
        let text = match record.source.diagnosis.as_deref() {
            Some(raw) => self.vocabulary.expand_abbreviations(raw),
            None => record.diagnosis.display_text().to_string(),
        };
        if text.trim().is_empty() {
            record.diagnosis = Diagnosis::Unknown;
            return;
        }

        record.diagnosis = match self.vocabulary.match_diagnosis(
            &text,
            self.config.max_edit_distance,
            self.config.min_fuzzy_length,
        ) {
            DiagnosisMatch::Exact(name) => Diagnosis::Canonical(name),
            DiagnosisMatch::Fuzzy { name, distance } => {
                debug!(from = %text, to = %name, distance, "Fuzzy diagnosis match");
                Diagnosis::Canonical(name)
            }
            DiagnosisMatch::NoMatch => {
                record.flags.insert(ValidationFlag::UnrecognizedDiagnosis);
                Diagnosis::Unrecognized(text)
            }
        };
    }
}
