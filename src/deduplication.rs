//! # Record Deduplication Module
//!
//! Registers often carry the same visit twice: a row copied onto the next page,
//! or the same page photographed twice. This module marks such records with
//! `DuplicateOf` instead of removing them, so the physical row count stays intact.
//!
//! Two records are duplicate candidates when
//!
//! - age, gender, canonical diagnosis and date are all known and equal, and the
//!   normalized treatment texts are similar enough, or
//! - both carry the same explicit patient identifier.
//!
//! The record with the higher recognizer confidence stays canonical; ties go to
//! the earlier row. Prior batches can be consulted through a [`BatchWindow`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::DeduplicationConfig;
use crate::model::{Gender, PatientRecord, RegisterBatch, ValidationFlag};
use crate::similarity::normalized_similarity;

/// Outcome of one deduplication pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeduplicationReport {
    /// Records newly marked as duplicates, within the batch or across batches
    pub duplicates_marked: usize,
    /// Subset of `duplicates_marked` matched against a prior batch
    pub cross_batch_duplicates: usize,
}

/// Canonical records of one prior batch
#[derive(Debug, Clone)]
struct WindowEntry {
    provenance: String,
    records: Vec<PatientRecord>,
}

/// Rolling window of recently processed batches.
///
/// Owned by the caller; the pipeline only reads it. Holds at most `capacity`
/// batches and evicts the oldest first.
#[derive(Debug, Clone)]
pub struct BatchWindow {
    entries: VecDeque<WindowEntry>,
    capacity: usize,
}

impl BatchWindow {
    /// Window holding `window_size` prior batches
    pub fn from_config(config: &DeduplicationConfig) -> Self {
        Self::new(config.window_size)
    }

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember the canonical records of a processed batch.
    ///
    /// Pushing a batch with a provenance already in the window replaces it.
    pub fn push(&mut self, batch: &RegisterBatch) {
        if self.capacity == 0 {
            return;
        }
        self.entries.retain(|e| e.provenance != batch.provenance);
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(WindowEntry {
            provenance: batch.provenance.clone(),
            records: batch.canonical_records().cloned().collect(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, provenance: &str) -> bool {
        self.entries.iter().any(|e| e.provenance == provenance)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> WindowStats {
        WindowStats {
            batches: self.entries.len(),
            records: self.entries.iter().map(|e| e.records.len()).sum(),
            capacity: self.capacity,
        }
    }
}

/// Statistics about the rolling window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    pub batches: usize,
    pub records: usize,
    pub capacity: usize,
}

/// Window shared between concurrent callers
pub type SharedBatchWindow = Arc<Mutex<BatchWindow>>;

pub fn create_shared_window(capacity: usize) -> SharedBatchWindow {
    Arc::new(Mutex::new(BatchWindow::new(capacity)))
}

/// Duplicate detection within a batch and against a window of prior batches
#[derive(Debug, Clone, Default)]
pub struct DeduplicationEngine {
    config: DeduplicationConfig,
}

impl DeduplicationEngine {
    pub fn new(config: DeduplicationConfig) -> Self {
        Self { config }
    }

    /// Mark duplicates in `batch`.
    ///
    /// Records already marked as duplicates are left alone, so running the pass
    /// again over its own output marks nothing new.
    pub fn deduplicate(
        &self,
        batch: &mut RegisterBatch,
        window: Option<&BatchWindow>,
    ) -> DeduplicationReport {
        let mut order: Vec<usize> = (0..batch.records.len())
            .filter(|&i| !batch.records[i].is_duplicate())
            .collect();
        order.sort_by(|&a, &b| {
            let (ra, rb) = (&batch.records[a], &batch.records[b]);
            rb.source_confidence
                .total_cmp(&ra.source_confidence)
                .then(ra.row_index.cmp(&rb.row_index))
        });

        let mut report = DeduplicationReport::default();
        let mut canonical: Vec<usize> = Vec::new();

        for idx in order {
            let record = &batch.records[idx];

            let in_batch = canonical
                .iter()
                .find(|&&c| self.is_duplicate_pair(&batch.records[c], record))
                .map(|&c| ValidationFlag::DuplicateOf {
                    record_id: batch.records[c].record_id.clone(),
                    batch: None,
                });

            let flag = in_batch.or_else(|| {
                window.and_then(|w| self.find_in_window(w, &batch.provenance, record))
            });

            match flag {
                Some(flag) => {
                    debug!(record_id = %record.record_id, duplicate_of = %flag, "Marked duplicate");
                    if matches!(flag, ValidationFlag::DuplicateOf { batch: Some(_), .. }) {
                        report.cross_batch_duplicates += 1;
                    }
                    report.duplicates_marked += 1;
                    batch.records[idx].flags.insert(flag);
                }
                None => canonical.push(idx),
            }
        }

        info!(
            "Deduplication marked {} of {} records ({} across batches)",
            report.duplicates_marked,
            batch.records.len(),
            report.cross_batch_duplicates
        );
        report
    }

    fn find_in_window(
        &self,
        window: &BatchWindow,
        provenance: &str,
        record: &PatientRecord,
    ) -> Option<ValidationFlag> {
        window
            .entries
            .iter()
            .rev()
            .filter(|entry| entry.provenance != provenance)
            .find_map(|entry| {
                entry
                    .records
                    .iter()
                    .find(|prior| self.is_duplicate_pair(prior, record))
                    .map(|prior| ValidationFlag::DuplicateOf {
                        record_id: prior.record_id.clone(),
                        batch: Some(entry.provenance.clone()),
                    })
            })
    }

    /// Whether two records describe the same register entry
    pub fn is_duplicate_pair(&self, a: &PatientRecord, b: &PatientRecord) -> bool {
        if self.config.match_patient_ids {
            if let (Some(id_a), Some(id_b)) = (normalized_id(a), normalized_id(b)) {
                if id_a == id_b {
                    return true;
                }
            }
        }

        let keys_match = a.age.is_some()
            && a.age == b.age
            && a.gender != Gender::Unknown
            && a.gender == b.gender
            && a.diagnosis.canonical().is_some()
            && a.diagnosis.canonical() == b.diagnosis.canonical()
            && a.date.is_some()
            && a.date == b.date;
        if !keys_match {
            return false;
        }

        let similarity = normalized_similarity(
            a.treatment.as_deref().unwrap_or(""),
            b.treatment.as_deref().unwrap_or(""),
        );
        similarity >= self.config.treatment_similarity_threshold
    }
}

fn normalized_id(record: &PatientRecord) -> Option<String> {
    record
        .patient_id
        .as_deref()
        .map(|id| id.trim().to_lowercase())
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Diagnosis;
    use chrono::NaiveDate;

    fn record(row: usize, confidence: f32, treatment: &str) -> PatientRecord {
        let mut record = PatientRecord::new(row, confidence);
        record.age = Some(25);
        record.gender = Gender::F;
        record.diagnosis = Diagnosis::Canonical("Paludisme".to_string());
        record.treatment = Some(treatment.to_string());
        record.date = NaiveDate::from_ymd_opt(2024, 1, 15);
        record
    }

    fn batch(provenance: &str, records: Vec<PatientRecord>) -> RegisterBatch {
        let mut batch = RegisterBatch::new(provenance);
        batch.records = records;
        batch
    }

    #[test]
    fn test_treatment_variants_keep_higher_confidence() {
        let mut batch = batch(
            "a",
            vec![
                record(0, 0.7, "Artemether-Lumefantrine"),
                record(1, 0.9, "Artemeter Lumefantrine"),
            ],
        );
        let report = DeduplicationEngine::default().deduplicate(&mut batch, None);

        assert_eq!(report.duplicates_marked, 1);
        assert!(!batch.records[1].is_duplicate());
        assert_eq!(
            batch.records[0].duplicate_of(),
            Some(&ValidationFlag::DuplicateOf {
                record_id: "row-2".to_string(),
                batch: None
            })
        );
    }

    #[test]
    fn test_equal_confidence_keeps_earliest_row() {
        let mut batch = batch(
            "a",
            vec![record(0, 0.8, "Quinine"), record(1, 0.8, "Quinine")],
        );
        DeduplicationEngine::default().deduplicate(&mut batch, None);
        assert!(!batch.records[0].is_duplicate());
        assert!(batch.records[1].is_duplicate());
    }

    #[test]
    fn test_different_treatment_or_unknown_key_is_not_duplicate() {
        let mut unknown_date = record(1, 0.8, "Quinine");
        unknown_date.date = None;
        let mut batch = batch(
            "a",
            vec![
                record(0, 0.8, "Quinine"),
                unknown_date.clone(),
                record(2, 0.8, "Amoxicilline"),
            ],
        );
        let mut unknown_twin = unknown_date;
        unknown_twin.row_index = 3;
        unknown_twin.record_id = "row-4".to_string();
        batch.records.push(unknown_twin);

        let report = DeduplicationEngine::default().deduplicate(&mut batch, None);
        assert_eq!(report.duplicates_marked, 0);
    }

    #[test]
    fn test_patient_id_match() {
        let mut first = record(0, 0.9, "Quinine");
        first.patient_id = Some(" P-12 ".to_string());
        let mut second = PatientRecord::new(1, 0.5);
        second.patient_id = Some("p-12".to_string());
        let mut batch = batch("a", vec![first, second]);

        DeduplicationEngine::default().deduplicate(&mut batch, None);
        assert!(batch.records[1].is_duplicate());

        let engine = DeduplicationEngine::new(DeduplicationConfig {
            match_patient_ids: false,
            ..Default::default()
        });
        assert!(!engine.is_duplicate_pair(&batch.records[0], &batch.records[1]));
    }

    #[test]
    fn test_second_pass_marks_nothing() {
        let mut batch = batch(
            "a",
            vec![
                record(0, 0.6, "Quinine"),
                record(1, 0.9, "Quinine"),
                record(2, 0.7, "Quinine"),
            ],
        );
        let engine = DeduplicationEngine::default();
        let first = engine.deduplicate(&mut batch, None);
        let snapshot = batch.clone();
        let second = engine.deduplicate(&mut batch, None);

        assert_eq!(first.duplicates_marked, 2);
        assert_eq!(second.duplicates_marked, 0);
        assert_eq!(batch, snapshot);
    }

    #[test]
    fn test_window_matches_prior_batch_but_not_itself() {
        let engine = DeduplicationEngine::default();
        let prior = batch("prior", vec![record(4, 0.9, "Quinine")]);
        let mut window = BatchWindow::new(2);
        window.push(&prior);

        let mut current = batch("current", vec![record(0, 0.95, "Quinine")]);
        let report = engine.deduplicate(&mut current, Some(&window));
        assert_eq!(report.cross_batch_duplicates, 1);
        assert_eq!(
            current.records[0].flag_labels(),
            "DuplicateOf:row-5@prior"
        );

        // Reprocessing the same image does not match against its own earlier run
        let mut again = batch("prior", vec![record(4, 0.9, "Quinine")]);
        let report = engine.deduplicate(&mut again, Some(&window));
        assert_eq!(report.duplicates_marked, 0);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = BatchWindow::new(2);
        for provenance in ["a", "b", "c"] {
            window.push(&batch(provenance, vec![record(0, 0.9, "Quinine")]));
        }
        assert_eq!(window.len(), 2);
        assert!(!window.contains("a"));
        assert!(window.contains("c"));
        assert_eq!(
            window.stats(),
            WindowStats {
                batches: 2,
                records: 2,
                capacity: 2
            }
        );

        let shared = create_shared_window(1);
        shared.lock().push(&batch("x", Vec::new()));
        assert_eq!(shared.lock().len(), 1);
    }

    #[test]
    fn test_window_capacity_follows_config() {
        let config = DeduplicationConfig {
            window_size: 1,
            ..Default::default()
        };
        let mut window = BatchWindow::from_config(&config);
        assert_eq!(window.stats().capacity, 1);

        window.push(&batch("a", vec![record(0, 0.9, "Quinine")]));
        window.push(&batch("b", vec![record(0, 0.9, "Quinine")]));
        assert!(!window.contains("a"));

        let mut current = batch("c", vec![record(0, 0.8, "Quinine")]);
        let report = DeduplicationEngine::new(config).deduplicate(&mut current, Some(&window));
        assert_eq!(report.cross_batch_duplicates, 1);
        assert_eq!(
            current.records[0].duplicate_of(),
            Some(&ValidationFlag::DuplicateOf {
                record_id: "row-1".to_string(),
                batch: Some("b".to_string())
            })
        );

        let default_window = BatchWindow::from_config(&DeduplicationConfig::default());
        assert_eq!(
            default_window.stats().capacity,
            DeduplicationConfig::default().window_size
        );
    }
}
