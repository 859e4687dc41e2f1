#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use register_extract::config::DeduplicationConfig;
    use register_extract::deduplication::{create_shared_window, BatchWindow, DeduplicationEngine};
    use register_extract::model::{Diagnosis, Gender, PatientRecord, RegisterBatch, ValidationFlag};

    fn record(row: usize, confidence: f32, age: u32, treatment: &str) -> PatientRecord {
        let mut record = PatientRecord::new(row, confidence);
        record.age = Some(age);
        record.gender = Gender::M;
        record.diagnosis = Diagnosis::Canonical("Hypertension".to_string());
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
    fn test_higher_confidence_record_stays_canonical() {
        let mut batch = batch(
            "page-1",
            vec![
                record(0, 0.7, 40, "Amlodipine"),
                record(1, 0.95, 40, "Amlodipine"),
                record(2, 0.8, 40, "Amlodipin"),
            ],
        );

        let report = DeduplicationEngine::default().deduplicate(&mut batch, None);

        assert_eq!(report.duplicates_marked, 2);
        assert!(!batch.records[1].is_duplicate());
        for index in [0, 2] {
            assert_eq!(
                batch.records[index].duplicate_of(),
                Some(&ValidationFlag::DuplicateOf {
                    record_id: "row-2".to_string(),
                    batch: None
                })
            );
        }
        assert_eq!(batch.canonical_records().count(), 1);
    }

    #[test]
    fn test_different_key_fields_are_kept() {
        let mut other_day = record(2, 0.9, 40, "Amlodipine");
        other_day.date = NaiveDate::from_ymd_opt(2024, 1, 16);
        let mut no_gender = record(3, 0.9, 40, "Amlodipine");
        no_gender.gender = Gender::Unknown;

        let mut batch = batch(
            "page-1",
            vec![
                record(0, 0.9, 40, "Amlodipine"),
                record(1, 0.9, 41, "Amlodipine"),
                other_day,
                no_gender,
                record(4, 0.9, 40, "Hydrochlorothiazide"),
            ],
        );

        let report = DeduplicationEngine::default().deduplicate(&mut batch, None);
        assert_eq!(report.duplicates_marked, 0);
    }

    #[test]
    fn test_patient_id_matching_can_be_disabled() {
        let mut first = record(0, 0.9, 30, "Amlodipine");
        first.patient_id = Some("A-12".to_string());
        let mut second = record(1, 0.8, 52, "Quinine");
        second.patient_id = Some(" a-12 ".to_string());

        let engine = DeduplicationEngine::default();
        assert!(engine.is_duplicate_pair(&first, &second));

        let engine = DeduplicationEngine::new(DeduplicationConfig {
            match_patient_ids: false,
            ..Default::default()
        });
        assert!(!engine.is_duplicate_pair(&first, &second));
    }

    #[test]
    fn test_second_pass_marks_nothing() {
        let mut batch = batch(
            "page-1",
            vec![
                record(0, 0.9, 40, "Amlodipine"),
                record(1, 0.9, 40, "Amlodipine"),
                record(2, 0.9, 40, "Amlodipine"),
            ],
        );
        let engine = DeduplicationEngine::default();

        assert_eq!(engine.deduplicate(&mut batch, None).duplicates_marked, 2);
        let after_first = batch.clone();
        assert_eq!(engine.deduplicate(&mut batch, None).duplicates_marked, 0);
        assert_eq!(batch, after_first);
    }

    #[test]
    fn test_window_evicts_oldest_batch() {
        let mut window = BatchWindow::new(2);
        window.push(&batch("page-1", vec![record(0, 0.9, 40, "Amlodipine")]));
        window.push(&batch("page-2", vec![record(0, 0.9, 55, "Amlodipine")]));
        window.push(&batch("page-3", vec![record(0, 0.9, 70, "Amlodipine")]));

        assert_eq!(window.len(), 2);
        assert!(!window.contains("page-1"));

        let mut current = batch(
            "page-4",
            vec![record(0, 0.9, 40, "Amlodipine"), record(1, 0.9, 55, "Amlodipine")],
        );
        let report = DeduplicationEngine::default().deduplicate(&mut current, Some(&window));

        assert_eq!(report.cross_batch_duplicates, 1);
        assert!(!current.records[0].is_duplicate());
        assert_eq!(
            current.records[1].duplicate_of(),
            Some(&ValidationFlag::DuplicateOf {
                record_id: "row-1".to_string(),
                batch: Some("page-2".to_string())
            })
        );
    }

    #[test]
    fn test_shared_window_across_tasks() {
        let window = create_shared_window(3);
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let window = window.clone();
                std::thread::spawn(move || {
                    let page = batch(&format!("page-{}", i), vec![record(0, 0.9, 40 + i, "Quinine")]);
                    window.lock().push(&page);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = window.lock().stats();
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.records, 3);
    }
}
