//! # Export Module
//!
//! Serializes one in-memory [`ExtractionResult`] into the formats consumed by
//! downstream tooling. Every format reads the same batch and statistics; nothing
//! is recomputed here.
//!
//! | Format        | Content                                                   |
//! |---------------|-----------------------------------------------------------|
//! | CSV           | `id, age, gender, diagnosis, treatment, date, flags`      |
//! | Nested JSON   | batch metadata, `patients`, `statistics`                  |
//! | Flat JSON     | the CSV rows as a JSON array                              |
//! | Workbook      | `Patients` and `Statistics` sheets, each renderable as CSV |
//!
//! The nested JSON document can be read back with [`import_nested_json`].

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregation::{AggregateStats, UNCLASSIFIED_LABEL};
use crate::errors::{error_logging, AppError, AppResult};
use crate::model::{PatientRecord, RegisterBatch};
use crate::pipeline::ExtractionResult;

pub const PATIENTS_SHEET: &str = "Patients";
pub const STATISTICS_SHEET: &str = "Statistics";

/// One row of the tabular exports, in fixed column order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatRow {
    pub id: String,
    pub age: Option<u32>,
    pub gender: String,
    pub diagnosis: String,
    pub treatment: String,
    pub date: String,
    pub flags: String,
}

impl FlatRow {
    pub const HEADERS: [&'static str; 7] =
        ["id", "age", "gender", "diagnosis", "treatment", "date", "flags"];

    fn from_record(record: &PatientRecord) -> Self {
        Self {
            id: record.record_id.clone(),
            age: record.age,
            gender: record.gender.label().to_string(),
            diagnosis: record.diagnosis.display_text().to_string(),
            treatment: record.treatment.clone().unwrap_or_default(),
            date: record
                .date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            flags: record.flag_labels(),
        }
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.age.map(|a| a.to_string()).unwrap_or_default(),
            self.gender.clone(),
            self.diagnosis.clone(),
            self.treatment.clone(),
            self.date.clone(),
            self.flags.clone(),
        ]
    }
}

/// Rows of the tabular exports, one per record in row order
pub fn flat_rows(batch: &RegisterBatch) -> Vec<FlatRow> {
    batch.records.iter().map(FlatRow::from_record).collect()
}

/// Header row first, even for a batch without records
fn write_rows<W: std::io::Write>(writer: &mut csv::Writer<W>, batch: &RegisterBatch) -> AppResult<()> {
    writer.write_record(FlatRow::HEADERS)?;
    for row in flat_rows(batch) {
        writer.serialize(row)?;
    }
    Ok(())
}

/// Render the CSV export
pub fn to_csv_string(result: &ExtractionResult) -> AppResult<String> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    write_rows(&mut writer, &result.batch)?;
    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::Export(format!("Failed to finish CSV: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| AppError::Export(format!("CSV is not UTF-8: {}", e)))
}

/// Write the CSV export to a file
pub fn write_csv(result: &ExtractionResult, path: &Path) -> AppResult<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .inspect_err(|e| {
            error_logging::log_export_error(
                e,
                "write_csv",
                Some(&result.batch.provenance),
                Some(result.batch.records.len()),
            )
        })?;
    write_rows(&mut writer, &result.batch)?;
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NestedDocumentRef<'a> {
    center_name: &'a Option<String>,
    date: &'a Option<NaiveDate>,
    provenance: &'a str,
    skipped_rows: usize,
    cancelled: bool,
    patients: &'a [PatientRecord],
    statistics: &'a AggregateStats,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedDocument {
    center_name: Option<String>,
    date: Option<NaiveDate>,
    provenance: String,
    #[serde(default)]
    skipped_rows: usize,
    #[serde(default)]
    cancelled: bool,
    patients: Vec<PatientRecord>,
    statistics: AggregateStats,
}

/// Render the nested JSON document `{centerName, date, ..., patients, statistics}`
pub fn to_nested_json(result: &ExtractionResult) -> AppResult<String> {
    let batch = &result.batch;
    let document = NestedDocumentRef {
        center_name: &batch.center_name,
        date: &batch.batch_date,
        provenance: &batch.provenance,
        skipped_rows: batch.skipped_rows,
        cancelled: batch.cancelled,
        patients: &batch.records,
        statistics: &result.statistics,
    };
    Ok(serde_json::to_string_pretty(&document)?)
}

/// Render the flat JSON row array, without statistics
pub fn to_flat_json(result: &ExtractionResult) -> AppResult<String> {
    Ok(serde_json::to_string_pretty(&flat_rows(&result.batch))?)
}

/// Read a nested JSON document back into a result
pub fn import_nested_json(json: &str) -> AppResult<ExtractionResult> {
    let document: NestedDocument = serde_json::from_str(json).map_err(|e| {
        error_logging::log_export_error(&e, "import_nested_json", None, None);
        AppError::Import(format!("Invalid register document: {}", e))
    })?;

    let mut seen = std::collections::HashSet::new();
    if let Some(duplicate) = document
        .patients
        .iter()
        .find(|p| !seen.insert(p.record_id.as_str()))
    {
        return Err(AppError::Import(format!(
            "Record id '{}' appears more than once",
            duplicate.record_id
        )));
    }

    Ok(ExtractionResult {
        batch: RegisterBatch {
            center_name: document.center_name,
            batch_date: document.date,
            provenance: document.provenance,
            records: document.patients,
            skipped_rows: document.skipped_rows,
            cancelled: document.cancelled,
        },
        statistics: document.statistics,
        warnings: Vec::new(),
    })
}

/// A named table of string cells
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    pub fn to_csv(&self) -> AppResult<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| AppError::Export(format!("Failed to finish sheet {}: {}", self.name, e)))?;
        String::from_utf8(bytes)
            .map_err(|e| AppError::Export(format!("Sheet {} is not UTF-8: {}", self.name, e)))
    }
}

/// Two-sheet tabular export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }
}

/// Build the `Patients` and `Statistics` sheets.
///
/// The statistics sheet lists diagnosis, count and percentage; the unclassified
/// remainder is appended when non-empty so percentages add up to 100.
pub fn to_workbook(result: &ExtractionResult) -> Workbook {
    let patients = Sheet {
        name: PATIENTS_SHEET.to_string(),
        headers: FlatRow::HEADERS.iter().map(|h| h.to_string()).collect(),
        rows: flat_rows(&result.batch).iter().map(FlatRow::cells).collect(),
    };

    let statistics = &result.statistics;
    let mut rows: Vec<Vec<String>> = statistics
        .diagnosis
        .iter()
        .map(|c| vec![c.label.clone(), c.count.to_string(), format!("{:.2}", c.percentage)])
        .collect();
    if statistics.unclassified_diagnoses.count > 0 {
        rows.push(vec![
            UNCLASSIFIED_LABEL.to_string(),
            statistics.unclassified_diagnoses.count.to_string(),
            format!("{:.2}", statistics.unclassified_diagnoses.percentage),
        ]);
    }

    Workbook {
        sheets: vec![
            patients,
            Sheet {
                name: STATISTICS_SHEET.to_string(),
                headers: vec![
                    "diagnosis".to_string(),
                    "count".to_string(),
                    "percentage".to_string(),
                ],
                rows,
            },
        ],
    }
}

/// Files written by [`export_all`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFiles {
    pub csv: PathBuf,
    pub nested_json: PathBuf,
    pub flat_json: PathBuf,
    pub sheets: Vec<PathBuf>,
}

/// Write every export format into `dir`
pub fn export_all(result: &ExtractionResult, dir: &Path) -> AppResult<ExportedFiles> {
    fs::create_dir_all(dir).inspect_err(|e| {
        error_logging::log_filesystem_error(e, "create_export_dir", dir.to_str(), None)
    })?;

    let csv_path = dir.join("register.csv");
    write_csv(result, &csv_path)?;

    let nested_path = dir.join("register.json");
    write_file(&nested_path, &to_nested_json(result)?)?;

    let flat_path = dir.join("register_rows.json");
    write_file(&flat_path, &to_flat_json(result)?)?;

    let mut sheets = Vec::new();
    for sheet in to_workbook(result).sheets {
        let path = dir.join(format!("register_{}.csv", sheet.name.to_lowercase()));
        write_file(&path, &sheet.to_csv()?)?;
        sheets.push(path);
    }

    info!(
        "Exported {} records of batch {} to {}",
        result.batch.records.len(),
        result.batch.provenance,
        dir.display()
    );

    Ok(ExportedFiles {
        csv: csv_path,
        nested_json: nested_path,
        flat_json: flat_path,
        sheets,
    })
}

fn write_file(path: &Path, content: &str) -> AppResult<()> {
    fs::write(path, content).map_err(|e| {
        error_logging::log_filesystem_error(&e, "write_export", path.to_str(), None);
        AppError::FileSystem(format!("Cannot write {}: {}", path.display(), e))
    })
}
