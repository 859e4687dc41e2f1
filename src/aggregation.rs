//! # Aggregation Module
//!
//! Derives summary statistics from a batch: counts by canonical diagnosis, age
//! band and gender, plus the headline figures shown on a register dashboard.
//! Statistics are never stored; they are recomputed from the records on demand.
//!
//! Percentages use largest-remainder rounding on hundredths of a percent, so the
//! categories of every dimension (including the unclassified/unknown remainder)
//! add up to exactly 100.00 whenever at least one record is counted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::model::{Gender, PatientRecord, RegisterBatch};

/// Fixed age bands, inclusive bounds
const AGE_BANDS: [(&str, u32, u32); 4] = [
    ("0-5", 0, 5),
    ("6-18", 6, 18),
    ("19-60", 19, 60),
    ("60+", 61, u32::MAX),
];

pub const UNKNOWN_LABEL: &str = "unknown";
pub const UNCLASSIFIED_LABEL: &str = "unclassified";

/// Which records enter the counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregationOptions {
    /// Count records marked `DuplicateOf` too (raw volume reporting)
    pub include_duplicates: bool,
    /// Only count records without any flag and above `confidence_threshold`
    pub high_confidence_only: bool,
    pub confidence_threshold: f32,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            include_duplicates: false,
            high_confidence_only: false,
            confidence_threshold: 0.6,
        }
    }
}

/// One category of a dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCount {
    pub label: String,
    pub count: usize,
    pub percentage: f64,
}

/// Summary statistics of one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    /// Every record of the batch
    pub total_records: usize,
    /// Records selected by the options; the percentage denominator
    pub counted_records: usize,
    /// Canonical diagnoses, most frequent first, ties alphabetical
    pub diagnosis: Vec<CategoryCount>,
    /// Counted records whose diagnosis is unknown or unrecognized
    pub unclassified_diagnoses: CategoryCount,
    /// Non-empty age bands in band order, then `unknown`
    pub age_groups: Vec<CategoryCount>,
    /// Non-empty genders: M, F, unknown
    pub gender: Vec<CategoryCount>,
    /// Ages 0 through 5, the same span as the `0-5` band
    pub children_under_5: usize,
    pub adults: usize,
}

impl AggregateStats {
    pub fn diagnosis_count(&self, name: &str) -> Option<usize> {
        find_count(&self.diagnosis, name)
    }

    pub fn age_group_count(&self, band: &str) -> Option<usize> {
        find_count(&self.age_groups, band)
    }

    pub fn gender_count(&self, gender: Gender) -> Option<usize> {
        find_count(&self.gender, gender.label())
    }
}

fn find_count(categories: &[CategoryCount], label: &str) -> Option<usize> {
    categories.iter().find(|c| c.label == label).map(|c| c.count)
}

/// Compute statistics for a batch
pub fn aggregate(batch: &RegisterBatch, options: &AggregationOptions) -> AggregateStats {
    let counted: Vec<&PatientRecord> = batch
        .records
        .iter()
        .filter(|r| options.include_duplicates || !r.is_duplicate())
        .filter(|r| !options.high_confidence_only || r.is_high_confidence(options.confidence_threshold))
        .collect();
    let denominator = counted.len();

    // Diagnosis
    let mut by_diagnosis: BTreeMap<&str, usize> = BTreeMap::new();
    let mut unclassified = 0;
    for record in &counted {
        match record.diagnosis.canonical() {
            Some(name) => *by_diagnosis.entry(name).or_default() += 1,
            None => unclassified += 1,
        }
    }
    let mut diagnosis: Vec<(String, usize)> = by_diagnosis
        .into_iter()
        .map(|(name, count)| (name.to_string(), count))
        .collect();
    // BTreeMap order is alphabetical; a stable sort keeps it for equal counts
    diagnosis.sort_by(|a, b| b.1.cmp(&a.1));
    diagnosis.push((UNCLASSIFIED_LABEL.to_string(), unclassified));
    let mut diagnosis = with_percentages(diagnosis, denominator);
    let unclassified_diagnoses = diagnosis.pop().unwrap_or(CategoryCount {
        label: UNCLASSIFIED_LABEL.to_string(),
        count: 0,
        percentage: 0.0,
    });

    // Age bands
    let mut band_counts = [0usize; AGE_BANDS.len() + 1];
    for record in &counted {
        let slot = match record.age {
            Some(age) => AGE_BANDS
                .iter()
                .position(|(_, low, high)| (*low..=*high).contains(&age))
                .unwrap_or(AGE_BANDS.len()),
            None => AGE_BANDS.len(),
        };
        band_counts[slot] += 1;
    }
    let age_groups = AGE_BANDS
        .iter()
        .map(|(label, _, _)| *label)
        .chain(std::iter::once(UNKNOWN_LABEL))
        .zip(band_counts)
        .map(|(label, count)| (label.to_string(), count))
        .collect();
    let age_groups = non_empty(with_percentages(age_groups, denominator));

    // Gender
    let genders = [Gender::M, Gender::F, Gender::Unknown]
        .iter()
        .map(|g| {
            let count = counted.iter().filter(|r| r.gender == *g).count();
            (g.label().to_string(), count)
        })
        .collect();
    let gender = non_empty(with_percentages(genders, denominator));

    let children_under_5 = counted
        .iter()
        .filter(|r| r.age.is_some_and(|age| age <= 5))
        .count();
    let adults = counted
        .iter()
        .filter(|r| r.age.is_some_and(|age| age >= 19))
        .count();

    debug!(
        total = batch.records.len(),
        counted = denominator,
        diagnoses = diagnosis.len(),
        "Aggregated batch statistics"
    );

    AggregateStats {
        total_records: batch.records.len(),
        counted_records: denominator,
        diagnosis,
        unclassified_diagnoses,
        age_groups,
        gender,
        children_under_5,
        adults,
    }
}

fn non_empty(categories: Vec<CategoryCount>) -> Vec<CategoryCount> {
    categories.into_iter().filter(|c| c.count > 0).collect()
}

/// Attach two-decimal percentages using the largest-remainder method.
///
/// Counts are expected to partition `denominator`. Leftover hundredths go to
/// the largest remainders, earlier categories first on ties.
fn with_percentages(counts: Vec<(String, usize)>, denominator: usize) -> Vec<CategoryCount> {
    const UNITS: usize = 10_000;

    if denominator == 0 {
        return counts
            .into_iter()
            .map(|(label, count)| CategoryCount {
                label,
                count,
                percentage: 0.0,
            })
            .collect();
    }

    let mut units: Vec<usize> = counts.iter().map(|(_, c)| c * UNITS / denominator).collect();
    let remainders: Vec<usize> = counts.iter().map(|(_, c)| c * UNITS % denominator).collect();

    let assigned: usize = units.iter().sum();
    let leftover = UNITS.saturating_sub(assigned);
    let mut order: Vec<usize> = (0..counts.len()).collect();
    order.sort_by(|&a, &b| remainders[b].cmp(&remainders[a]).then(a.cmp(&b)));
    for &i in order.iter().take(leftover) {
        units[i] += 1;
    }

    counts
        .into_iter()
        .zip(units)
        .map(|((label, count), units)| CategoryCount {
            label,
            count,
            percentage: units as f64 / 100.0,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Diagnosis, ValidationFlag};

    fn record(row: usize, age: Option<u32>, gender: Gender, diagnosis: Option<&str>) -> PatientRecord {
        let mut record = PatientRecord::new(row, 0.9);
        record.age = age;
        record.gender = gender;
        record.diagnosis = diagnosis
            .map(|d| Diagnosis::Canonical(d.to_string()))
            .unwrap_or_default();
        record
    }

    fn batch(records: Vec<PatientRecord>) -> RegisterBatch {
        let mut batch = RegisterBatch::new("abc");
        batch.records = records;
        batch
    }

    fn sum(categories: &[CategoryCount]) -> f64 {
        categories.iter().map(|c| c.percentage).sum()
    }

    #[test]
    fn test_three_record_scenario() {
        let stats = aggregate(
            &batch(vec![
                record(0, Some(25), Gender::F, Some("Paludisme")),
                record(1, Some(32), Gender::F, Some("Paludisme")),
                record(2, Some(5), Gender::M, Some("Diarrhée")),
            ]),
            &AggregationOptions::default(),
        );

        let diagnoses: Vec<(&str, usize)> = stats
            .diagnosis
            .iter()
            .map(|c| (c.label.as_str(), c.count))
            .collect();
        assert_eq!(diagnoses, vec![("Paludisme", 2), ("Diarrhée", 1)]);

        let bands: Vec<(&str, usize)> = stats
            .age_groups
            .iter()
            .map(|c| (c.label.as_str(), c.count))
            .collect();
        assert_eq!(bands, vec![("0-5", 1), ("19-60", 2)]);

        assert_eq!(stats.gender_count(Gender::F), Some(2));
        assert_eq!(stats.gender_count(Gender::M), Some(1));
        assert_eq!(stats.gender_count(Gender::Unknown), None);

        assert_eq!(stats.diagnosis[0].percentage, 66.67);
        assert_eq!(stats.diagnosis[1].percentage, 33.33);
        assert_eq!(stats.children_under_5, 1);
        assert_eq!(stats.adults, 2);
    }

    #[test]
    fn test_children_count_includes_age_five() {
        let stats = aggregate(
            &batch(vec![
                record(0, Some(5), Gender::M, Some("Diarrhée")),
                record(1, Some(3), Gender::F, Some("Paludisme")),
                record(2, Some(6), Gender::F, Some("Paludisme")),
            ]),
            &AggregationOptions::default(),
        );
        assert_eq!(stats.children_under_5, 2);
        assert_eq!(stats.age_group_count("0-5"), Some(stats.children_under_5));
    }

    #[test]
    fn test_ties_are_alphabetical() {
        let stats = aggregate(
            &batch(vec![
                record(0, Some(40), Gender::M, Some("Pneumonie")),
                record(1, Some(40), Gender::M, Some("Gastrite")),
                record(2, Some(40), Gender::M, Some("Anémie")),
            ]),
            &AggregationOptions::default(),
        );
        let labels: Vec<&str> = stats.diagnosis.iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["Anémie", "Gastrite", "Pneumonie"]);
        assert!((sum(&stats.diagnosis) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknowns_and_band_edges() {
        let stats = aggregate(
            &batch(vec![
                record(0, Some(0), Gender::F, None),
                record(1, Some(6), Gender::Unknown, Some("Rougeole")),
                record(2, Some(60), Gender::M, Some("Diabète")),
                record(3, Some(61), Gender::M, Some("Diabète")),
                record(4, None, Gender::F, Some("Diabète")),
                record(5, Some(18), Gender::F, Some("Rougeole")),
            ]),
            &AggregationOptions::default(),
        );
        assert_eq!(stats.age_group_count("0-5"), Some(1));
        assert_eq!(stats.age_group_count("6-18"), Some(2));
        assert_eq!(stats.age_group_count("19-60"), Some(1));
        assert_eq!(stats.age_group_count("60+"), Some(1));
        assert_eq!(stats.age_group_count("unknown"), Some(1));
        assert_eq!(stats.unclassified_diagnoses.count, 1);
        assert_eq!(stats.children_under_5, 1);

        let diagnosis_total = sum(&stats.diagnosis) + stats.unclassified_diagnoses.percentage;
        assert!((diagnosis_total - 100.0).abs() < 1e-9);
        assert!((sum(&stats.age_groups) - 100.0).abs() < 1e-9);
        assert!((sum(&stats.gender) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_duplicates_excluded_unless_requested() {
        let mut duplicate = record(1, Some(25), Gender::F, Some("Paludisme"));
        duplicate.flags.insert(ValidationFlag::DuplicateOf {
            record_id: "row-1".to_string(),
            batch: None,
        });
        let batch = batch(vec![record(0, Some(25), Gender::F, Some("Paludisme")), duplicate]);

        let stats = aggregate(&batch, &AggregationOptions::default());
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.counted_records, 1);
        assert_eq!(stats.diagnosis_count("Paludisme"), Some(1));

        let raw = aggregate(
            &batch,
            &AggregationOptions {
                include_duplicates: true,
                ..Default::default()
            },
        );
        assert_eq!(raw.diagnosis_count("Paludisme"), Some(2));
    }

    #[test]
    fn test_high_confidence_view_skips_flagged_records() {
        let mut flagged = record(1, Some(25), Gender::F, Some("Paludisme"));
        flagged.flags.insert(ValidationFlag::IncompleteRow);
        let mut unsure = record(2, Some(25), Gender::F, Some("Paludisme"));
        unsure.source_confidence = 0.3;
        let batch = batch(vec![record(0, Some(25), Gender::F, Some("Gastrite")), flagged, unsure]);

        let stats = aggregate(
            &batch,
            &AggregationOptions {
                high_confidence_only: true,
                ..Default::default()
            },
        );
        assert_eq!(stats.counted_records, 1);
        assert_eq!(stats.diagnosis_count("Paludisme"), None);
    }

    #[test]
    fn test_empty_batch_reports_zero() {
        let stats = aggregate(&batch(Vec::new()), &AggregationOptions::default());
        assert_eq!(stats.counted_records, 0);
        assert!(stats.diagnosis.is_empty());
        assert!(stats.age_groups.is_empty());
        assert_eq!(stats.unclassified_diagnoses.percentage, 0.0);
    }

    #[test]
    fn test_largest_remainder_sums_exactly() {
        let counts: Vec<(String, usize)> = (0..7).map(|i| (format!("c{i}"), 1)).collect();
        let categories = with_percentages(counts, 7);
        let units: usize = categories
            .iter()
            .map(|c| (c.percentage * 100.0).round() as usize)
            .sum();
        assert_eq!(units, 10_000);
        assert_eq!(categories[0].percentage, 14.29);
        assert_eq!(categories[6].percentage, 14.28);
    }
}
