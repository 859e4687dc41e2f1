//! # Register Data Model
//!
//! Types flowing through the extraction pipeline: recognizer tokens, patient
//! records with their validation flags, and the batch that owns them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Axis-aligned box of a recognized token, in image pixels
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn center_x(&self) -> f32 {
        self.x + self.width / 2.0
    }
}

/// A single text token returned by a field recognizer.
///
/// Tokens are immutable once produced; confidence is clamped into `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawToken {
    text: String,
    bounding_box: BoundingBox,
    confidence: f32,
    line_index: usize,
}

impl RawToken {
    pub fn new(
        text: impl Into<String>,
        bounding_box: BoundingBox,
        confidence: f32,
        line_index: usize,
    ) -> Self {
        Self {
            text: text.into(),
            bounding_box,
            confidence: clamp_confidence(confidence),
            line_index,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn bounding_box(&self) -> &BoundingBox {
        &self.bounding_box
    }

    /// Confidence in `[0, 1]`, also for tokens deserialized from fixtures
    pub fn confidence(&self) -> f32 {
        clamp_confidence(self.confidence)
    }

    pub fn line_index(&self) -> usize {
        self.line_index
    }
}

fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Patient gender as recorded in the register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Gender {
    M,
    F,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl Gender {
    pub fn label(&self) -> &'static str {
        match self {
            Gender::M => "M",
            Gender::F => "F",
            Gender::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Diagnosis of a record at the various pipeline stages.
///
/// `Raw` only exists between parsing and validation. A validated record carries
/// a canonical name, an unrecognized raw text (always flagged), or nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum Diagnosis {
    #[default]
    Unknown,
    Raw(String),
    Canonical(String),
    Unrecognized(String),
}

impl Diagnosis {
    pub fn canonical(&self) -> Option<&str> {
        match self {
            Diagnosis::Canonical(name) => Some(name),
            _ => None,
        }
    }

    /// Text shown to users and written to tabular exports
    pub fn display_text(&self) -> &str {
        match self {
            Diagnosis::Unknown => "",
            Diagnosis::Raw(text) | Diagnosis::Canonical(text) | Diagnosis::Unrecognized(text) => {
                text
            }
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Diagnosis::Unknown)
    }
}

/// Non-fatal annotation on a record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum ValidationFlag {
    IncompleteRow,
    InvalidAge,
    InvalidGender,
    UnrecognizedDiagnosis,
    LowConfidence,
    ContradictoryFields,
    DuplicateOf {
        record_id: String,
        /// Provenance of another batch when matched in the rolling window
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch: Option<String>,
    },
    Cancelled,
}

impl ValidationFlag {
    /// Stable label used in tabular exports
    pub fn label(&self) -> String {
        match self {
            ValidationFlag::IncompleteRow => "IncompleteRow".to_string(),
            ValidationFlag::InvalidAge => "InvalidAge".to_string(),
            ValidationFlag::InvalidGender => "InvalidGender".to_string(),
            ValidationFlag::UnrecognizedDiagnosis => "UnrecognizedDiagnosis".to_string(),
            ValidationFlag::LowConfidence => "LowConfidence".to_string(),
            ValidationFlag::ContradictoryFields => "ContradictoryFields".to_string(),
            ValidationFlag::DuplicateOf {
                record_id,
                batch: None,
            } => format!("DuplicateOf:{}", record_id),
            ValidationFlag::DuplicateOf {
                record_id,
                batch: Some(batch),
            } => format!("DuplicateOf:{}@{}", record_id, batch),
            ValidationFlag::Cancelled => "Cancelled".to_string(),
        }
    }

    /// Flags owned by the record validator and recomputed on every validation pass
    pub fn is_validator_flag(&self) -> bool {
        matches!(
            self,
            ValidationFlag::InvalidAge
                | ValidationFlag::InvalidGender
                | ValidationFlag::UnrecognizedDiagnosis
                | ValidationFlag::LowConfidence
                | ValidationFlag::ContradictoryFields
        )
    }
}

impl fmt::Display for ValidationFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Raw cell text per column, as read from the register
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// One register row turned into a structured patient entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientRecord {
    #[serde(rename = "id")]
    pub record_id: String,
    /// Zero-based position among the batch's data rows
    pub row_index: usize,
    pub patient_id: Option<String>,
    pub age: Option<u32>,
    pub gender: Gender,
    pub diagnosis: Diagnosis,
    pub treatment: Option<String>,
    pub date: Option<NaiveDate>,
    pub source_confidence: f32,
    pub flags: BTreeSet<ValidationFlag>,
    pub source: SourceFields,
}

impl PatientRecord {
    /// Empty record for a physical row; every field unknown
    pub fn new(row_index: usize, source_confidence: f32) -> Self {
        Self {
            record_id: format!("row-{}", row_index + 1),
            row_index,
            patient_id: None,
            age: None,
            gender: Gender::Unknown,
            diagnosis: Diagnosis::Unknown,
            treatment: None,
            date: None,
            source_confidence: clamp_confidence(source_confidence),
            flags: BTreeSet::new(),
            source: SourceFields::default(),
        }
    }

    /// Canonical record id this record duplicates, if any
    pub fn duplicate_of(&self) -> Option<&ValidationFlag> {
        self.flags
            .iter()
            .find(|flag| matches!(flag, ValidationFlag::DuplicateOf { .. }))
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of().is_some()
    }

    /// No flags at all and a recognizer confidence at or above `threshold`
    pub fn is_high_confidence(&self, threshold: f32) -> bool {
        self.flags.is_empty() && self.source_confidence >= threshold
    }

    /// Flags joined with `;`, in stable order
    pub fn flag_labels(&self) -> String {
        self.flags
            .iter()
            .map(ValidationFlag::label)
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// One processed register image and the records derived from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBatch {
    pub center_name: Option<String>,
    #[serde(rename = "date")]
    pub batch_date: Option<NaiveDate>,
    /// SHA-256 of the originating image bytes
    pub provenance: String,
    #[serde(rename = "patients")]
    pub records: Vec<PatientRecord>,
    pub skipped_rows: usize,
    #[serde(default)]
    pub cancelled: bool,
}

impl RegisterBatch {
    pub fn new(provenance: impl Into<String>) -> Self {
        Self {
            center_name: None,
            batch_date: None,
            provenance: provenance.into(),
            records: Vec::new(),
            skipped_rows: 0,
            cancelled: false,
        }
    }

    pub fn record(&self, record_id: &str) -> Option<&PatientRecord> {
        self.records.iter().find(|r| r.record_id == record_id)
    }

    /// Records not marked as duplicates of another record
    pub fn canonical_records(&self) -> impl Iterator<Item = &PatientRecord> {
        self.records.iter().filter(|r| !r.is_duplicate())
    }

    /// Flag every record as cancelled and mark the batch partial
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
        for record in &mut self.records {
            record.flags.insert(ValidationFlag::Cancelled);
        }
    }
}
