mod test_helpers;

#[cfg(test)]
mod tests {
    use super::test_helpers::*;
    use chrono::NaiveDate;
    use register_extract::config::{Column, DateLocale, ParserConfig};
    use register_extract::model::{Diagnosis, ValidationFlag};
    use register_extract::parser::{parse_date, RecordParser};
    use register_extract::vocabulary::MedicalVocabulary;
    use std::sync::Arc;

    fn parser(config: ParserConfig) -> RecordParser {
        RecordParser::new(config, Arc::new(MedicalVocabulary::builtin()))
    }

    #[test]
    fn test_preamble_metadata_and_dated_rows() {
        let mut tokens = vec![
            token(0, 0.0, "Centre de santé de Boromo", 0.9),
            token(1, 0.0, "Date: 12/03/2024", 0.9),
        ];
        tokens.extend(table(
            2,
            &[
                &["Âge", "Sexe", "", "Diagnostic", "Traitement", "Date"],
                &["34", "F", "", "Paludisme", "AL", "11/03/2024"],
                &["12", "M", "", "IRA", "Amox", ""],
            ],
            0.9,
        ));

        let parsed = parser(ParserConfig::default()).parse(&tokens, None);

        assert_eq!(parsed.center_name.as_deref(), Some("Centre de santé de Boromo"));
        assert_eq!(parsed.batch_date, NaiveDate::from_ymd_opt(2024, 3, 12));
        assert_eq!(parsed.skipped_rows, 3);
        assert_eq!(parsed.records.len(), 2);

        let first = &parsed.records[0];
        assert_eq!(first.date, NaiveDate::from_ymd_opt(2024, 3, 11));
        assert_eq!(first.age, Some(34));
        assert_eq!(first.diagnosis, Diagnosis::Raw("Paludisme".to_string()));
        assert!(first.flags.is_empty());

        // Row date falls back to the register date
        let second = &parsed.records[1];
        assert_eq!(second.date, NaiveDate::from_ymd_opt(2024, 3, 12));
        assert_eq!(
            second.diagnosis,
            Diagnosis::Raw("Infection respiratoire aiguë".to_string())
        );
        assert_eq!(second.treatment.as_deref(), Some("Amoxicilline"));
        assert!(!second.flags.contains(&ValidationFlag::IncompleteRow));
    }

    #[test]
    fn test_caller_date_overrides_preamble() {
        let mut tokens = vec![token(0, 0.0, "Date: 12/03/2024", 0.9)];
        tokens.extend(row(1, &["001", "30", "M", "HTA", "Amlodipine"], 0.9));

        let caller_date = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        let parsed = parser(ParserConfig::default()).parse(&tokens, Some(caller_date));

        assert_eq!(parsed.records[0].date, Some(caller_date));
        assert_eq!(parsed.batch_date, NaiveDate::from_ymd_opt(2024, 3, 12));
    }

    #[test]
    fn test_custom_column_order_without_header() {
        let config = ParserConfig {
            columns: vec![Column::Gender, Column::Age, Column::Diagnosis],
            ..Default::default()
        };
        let tokens = table(0, &[&["F", "3 ans", "Rougeole"], &["M", "61", "Diabète"]], 0.9);

        let parsed = parser(config).parse(&tokens, None);

        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].age, Some(3));
        assert_eq!(parsed.records[0].source.gender.as_deref(), Some("F"));
        assert_eq!(parsed.records[1].treatment, None);
        assert!(parsed.records.iter().all(|r| r.flags.is_empty()));
    }

    #[test]
    fn test_adjacent_tokens_form_one_cell() {
        let tokens = vec![
            token(0, 0.0, "001", 0.9),
            token(0, 100.0, "25", 0.9),
            token(0, 200.0, "F", 0.9),
            token(0, 300.0, "Fièvre", 0.9),
            token(0, 365.0, "typhoïde", 0.9),
            token(0, 700.0, "Ceftriaxone", 0.9),
        ];

        let parsed = parser(ParserConfig::default()).parse(&tokens, None);

        let record = &parsed.records[0];
        assert_eq!(record.source.diagnosis.as_deref(), Some("Fièvre typhoïde"));
        assert_eq!(record.treatment.as_deref(), Some("Ceftriaxone"));
    }

    #[test]
    fn test_rows_after_data_are_not_metadata() {
        let mut tokens = table(0, &[&["001", "30", "M", "HTA", "Amlodipine"]], 0.9);
        tokens.push(token(1, 0.0, "Centre: Annexe", 0.9));

        let parsed = parser(ParserConfig::default()).parse(&tokens, None);

        assert_eq!(parsed.center_name, None);
        assert_eq!(parsed.records.len(), 2);
        assert!(parsed.records[1]
            .flags
            .contains(&ValidationFlag::IncompleteRow));
    }

    #[test]
    fn test_english_dates() {
        assert_eq!(
            parse_date("03/11/2024", DateLocale::English),
            NaiveDate::from_ymd_opt(2024, 3, 11)
        );
        assert_eq!(
            parse_date("March 11, 2024", DateLocale::English),
            NaiveDate::from_ymd_opt(2024, 3, 11)
        );
        assert_eq!(
            parse_date("11 mars 2024", DateLocale::English),
            NaiveDate::from_ymd_opt(2024, 3, 11)
        );
        assert_eq!(parse_date("32/13/2024", DateLocale::English), None);
    }

    #[test]
    fn test_empty_token_list() {
        let parsed = parser(ParserConfig::default()).parse(&[], None);
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.skipped_rows, 0);
    }
}
