//! # Record Parser Module
//!
//! Turns the recognizer's positioned tokens into one [`PatientRecord`] per
//! register row.
//!
//! ## Layout heuristics
//!
//! 1. Tokens are grouped by line, then merged into cells when the horizontal gap
//!    between neighbours is small relative to the median token height
//! 2. Lines are classified as header, preamble metadata, noise/footer or data
//! 3. Data cells are mapped to columns, either by the anchors learned from the
//!    last header line or by cell type (date, id, age, gender, free text)
//!
//! A data row never disappears: missing cells leave the field unknown and add an
//! `IncompleteRow` flag.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, trace};

use crate::config::{Column, DateLocale, ParserConfig};
use crate::model::{Diagnosis, PatientRecord, RawToken, SourceFields, ValidationFlag};
use crate::vocabulary::MedicalVocabulary;

lazy_static! {
    static ref FOOTER_RE: Regex =
        Regex::new(r"(?i)^\s*(?:total|sous[- ]total|page\s*\d+|signature|visa|cachet)\b")
            .expect("Footer pattern should be valid");
    static ref CENTER_LABEL_RE: Regex = Regex::new(
        r"(?i)^\s*(?:centre|center|structure|formation sanitaire|health facility)\s*:\s*(.+?)\s*$"
    )
    .expect("Center label pattern should be valid");
    static ref CENTER_NAME_RE: Regex = Regex::new(
        r"(?i)^\s*(?:centre de sant[ée]|centre m[ée]dical|health cent(?:re|er)|csps|cscom)\b"
    )
    .expect("Center name pattern should be valid");
    static ref DATE_LABEL_RE: Regex = Regex::new(r"(?i)^\s*(?:date|jour)\s*[:\-]?\s*(.+?)\s*$")
        .expect("Date label pattern should be valid");
    static ref AGE_RE: Regex = Regex::new(r"(?i)^(\d{1,3})\s*(?:ans?|a|yrs?|years?)?\.?$")
        .expect("Age pattern should be valid");
    static ref ID_RE: Regex = Regex::new(r"(?i)^(?:n°\s*|#)?[a-z]{0,4}[-/]?\d{1,6}$")
        .expect("Id pattern should be valid");
    static ref ISO_DATE_RE: Regex =
        Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})$").expect("ISO date pattern should be valid");
    static ref NUMERIC_DATE_RE: Regex = Regex::new(r"^(\d{1,2})[/.\-](\d{1,2})[/.\-](\d{4}|\d{2})$")
        .expect("Numeric date pattern should be valid");
    static ref DAY_MONTH_NAME_RE: Regex =
        Regex::new(r"(?i)^(\d{1,2})(?:er|st|nd|rd|th)?\s+(\p{L}+)\.?,?\s+(\d{4})$")
            .expect("Day-month date pattern should be valid");
    static ref MONTH_NAME_DAY_RE: Regex =
        Regex::new(r"(?i)^(\p{L}+)\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})$")
            .expect("Month-day date pattern should be valid");
    static ref MONTH_NAMES: HashMap<&'static str, u32> = {
        let mut m = HashMap::new();
        let months: [(&[&str], u32); 12] = [
            (&["janvier", "janv", "jan", "january"], 1),
            (&["février", "fevrier", "févr", "fevr", "fév", "fev", "feb", "february"], 2),
            (&["mars", "mar", "march"], 3),
            (&["avril", "avr", "apr", "april"], 4),
            (&["mai", "may"], 5),
            (&["juin", "jun", "june"], 6),
            (&["juillet", "juil", "jul", "july"], 7),
            (&["août", "aout", "aug", "august"], 8),
            (&["septembre", "sept", "sep", "september"], 9),
            (&["octobre", "oct", "october"], 10),
            (&["novembre", "nov", "november"], 11),
            (&["décembre", "decembre", "déc", "dec", "december"], 12),
        ];
        for (names, number) in months {
            for name in names {
                m.insert(*name, number);
            }
        }
        m
    };
}

/// Parser output for one register page
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRegister {
    pub records: Vec<PatientRecord>,
    /// Header, metadata, footer and noise lines
    pub skipped_rows: usize,
    /// Center name read from the page preamble
    pub center_name: Option<String>,
    /// Register date read from the page preamble
    pub batch_date: Option<NaiveDate>,
}

/// Adjacent tokens merged into one table cell
#[derive(Debug, Clone)]
struct Cell {
    text: String,
    left: f32,
    right: f32,
}

impl Cell {
    fn center(&self) -> f32 {
        (self.left + self.right) / 2.0
    }
}

#[derive(Debug)]
struct Line {
    index: usize,
    cells: Vec<Cell>,
    confidence: f32,
}

impl Line {
    fn text(&self) -> String {
        self.cells
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug)]
enum LineKind {
    Header(Vec<(Column, f32)>),
    CenterName(String),
    BatchDate(NaiveDate),
    Noise(&'static str),
    Data,
}

/// Token-to-record parser
#[derive(Debug, Clone)]
pub struct RecordParser {
    config: ParserConfig,
    vocabulary: Arc<MedicalVocabulary>,
}

impl RecordParser {
    pub fn new(config: ParserConfig, vocabulary: Arc<MedicalVocabulary>) -> Self {
        Self { config, vocabulary }
    }

    /// Parse a page of tokens.
    ///
    /// `batch_date` is the caller-supplied register date; it takes precedence over
    /// a date read from the preamble and is the fallback for rows without a date.
    pub fn parse(&self, tokens: &[RawToken], batch_date: Option<NaiveDate>) -> ParsedRegister {
        let lines = self.build_lines(tokens);

        let mut parsed = ParsedRegister {
            records: Vec::new(),
            skipped_rows: 0,
            center_name: None,
            batch_date: None,
        };
        let mut anchors: Vec<(Column, f32)> = Vec::new();
        let mut data_lines: Vec<(Line, Vec<(Column, f32)>)> = Vec::new();

        for line in lines {
            let kind = self.classify(&line, data_lines.is_empty());
            trace!(line = line.index, kind = ?kind, "Classified register line");
            match kind {
                LineKind::Header(found) => {
                    debug!(line = line.index, columns = found.len(), "Learned column anchors from header");
                    anchors = found;
                    parsed.skipped_rows += 1;
                }
                LineKind::CenterName(name) => {
                    parsed.center_name.get_or_insert(name);
                    parsed.skipped_rows += 1;
                }
                LineKind::BatchDate(date) => {
                    parsed.batch_date.get_or_insert(date);
                    parsed.skipped_rows += 1;
                }
                LineKind::Noise(reason) => {
                    debug!(line = line.index, reason, "Skipping non-data line");
                    parsed.skipped_rows += 1;
                }
                LineKind::Data => data_lines.push((line, anchors.clone())),
            }
        }

        let fallback_date = batch_date.or(parsed.batch_date);
        for (row_index, (line, anchors)) in data_lines.into_iter().enumerate() {
            let record = self.build_record(row_index, &line, &anchors, fallback_date);
            parsed.records.push(record);
        }

        info!(
            "Parsed {} records from {} tokens ({} lines skipped)",
            parsed.records.len(),
            tokens.len(),
            parsed.skipped_rows
        );
        parsed
    }

    fn build_lines(&self, tokens: &[RawToken]) -> Vec<Line> {
        let max_gap = self.config.cell_gap_ratio * median_token_height(tokens);

        let mut grouped: BTreeMap<usize, Vec<&RawToken>> = BTreeMap::new();
        for token in tokens.iter().filter(|t| !t.text().trim().is_empty()) {
            grouped.entry(token.line_index()).or_default().push(token);
        }

        grouped
            .into_iter()
            .map(|(index, mut line_tokens)| {
                line_tokens.sort_by(|a, b| a.bounding_box().x.total_cmp(&b.bounding_box().x));
                let confidence = line_tokens.iter().map(|t| t.confidence()).sum::<f32>()
                    / line_tokens.len() as f32;

                let mut cells: Vec<Cell> = Vec::new();
                for token in line_tokens {
                    let bbox = token.bounding_box();
                    let text = token.text().trim();
                    match cells.last_mut() {
                        Some(cell) if bbox.x - cell.right < max_gap => {
                            cell.text.push(' ');
                            cell.text.push_str(text);
                            cell.right = cell.right.max(bbox.right());
                        }
                        _ => cells.push(Cell {
                            text: text.to_string(),
                            left: bbox.x,
                            right: bbox.right(),
                        }),
                    }
                }

                Line {
                    index,
                    cells,
                    confidence,
                }
            })
            .collect()
    }

    fn classify(&self, line: &Line, before_data: bool) -> LineKind {
        let text = line.text();

        if line.confidence < self.config.noise_confidence_floor {
            return LineKind::Noise("low confidence");
        }
        if !text.chars().any(char::is_alphanumeric) {
            return LineKind::Noise("no alphanumeric content");
        }
        if FOOTER_RE.is_match(&text) {
            return LineKind::Noise("footer");
        }

        let header: Vec<(Column, f32)> = line
            .cells
            .iter()
            .filter_map(|cell| self.header_column(&cell.text).map(|c| (c, cell.center())))
            .collect();
        if header.len() >= self.config.min_header_matches {
            return LineKind::Header(header);
        }

        if before_data {
            if let Some(caps) = CENTER_LABEL_RE.captures(&text) {
                return LineKind::CenterName(caps[1].to_string());
            }
            if CENTER_NAME_RE.is_match(&text) {
                return LineKind::CenterName(text.trim().to_string());
            }
            if let Some(date) = DATE_LABEL_RE
                .captures(&text)
                .and_then(|caps| parse_date(&caps[1], self.config.date_locale))
            {
                return LineKind::BatchDate(date);
            }
        }

        LineKind::Data
    }

    /// Header column of a cell, trying the whole text then each word
    fn header_column(&self, text: &str) -> Option<Column> {
        self.vocabulary.header_column(text).or_else(|| {
            text.split_whitespace()
                .next()
                .and_then(|word| self.vocabulary.header_column(word))
        })
    }

    fn build_record(
        &self,
        row_index: usize,
        line: &Line,
        anchors: &[(Column, f32)],
        fallback_date: Option<NaiveDate>,
    ) -> PatientRecord {
        let (fields, expected) = if anchors.is_empty() {
            (self.assign_by_type(&line.cells), self.config.columns.clone())
        } else {
            let expected = anchors.iter().map(|(column, _)| *column).collect();
            (assign_by_anchor(&line.cells, anchors), expected)
        };

        let mut record = PatientRecord::new(row_index, line.confidence);
        record.source = SourceFields {
            id: fields.get(&Column::Id).cloned(),
            age: fields.get(&Column::Age).cloned(),
            gender: fields.get(&Column::Gender).cloned(),
            diagnosis: fields.get(&Column::Diagnosis).cloned(),
            treatment: fields.get(&Column::Treatment).cloned(),
            date: fields.get(&Column::Date).cloned(),
        };

        record.patient_id = record.source.id.clone();
        record.age = record.source.age.as_deref().and_then(parse_age);
        record.gender = record
            .source
            .gender
            .as_deref()
            .and_then(|g| self.vocabulary.gender_for(g))
            .unwrap_or_default();
        record.diagnosis = match &record.source.diagnosis {
            Some(text) => Diagnosis::Raw(self.vocabulary.expand_abbreviations(text)),
            None => Diagnosis::Unknown,
        };
        record.treatment = record
            .source
            .treatment
            .as_deref()
            .map(|t| self.vocabulary.expand_abbreviations(t));
        record.date = record
            .source
            .date
            .as_deref()
            .and_then(|d| parse_date(d, self.config.date_locale))
            .or(fallback_date);

        let missing: Vec<Column> = expected
            .iter()
            .copied()
            .filter(|column| !fields.contains_key(column))
            .filter(|column| !(*column == Column::Date && fallback_date.is_some()))
            .collect();
        if !missing.is_empty() {
            debug!(record_id = %record.record_id, missing = ?missing, "Row is missing fields");
            record.flags.insert(ValidationFlag::IncompleteRow);
        }

        record
    }

    /// Map cells without a header: typed cells first, then free text in column order
    fn assign_by_type(&self, cells: &[Cell]) -> HashMap<Column, String> {
        let columns = &self.config.columns;
        let expects = |column: Column| columns.contains(&column);
        let mut fields: HashMap<Column, String> = HashMap::new();
        let mut text_cells: Vec<&str> = Vec::new();

        for (i, cell) in cells.iter().enumerate() {
            let text = cell.text.as_str();
            let free = |fields: &HashMap<Column, String>, column: Column| {
                expects(column) && !fields.contains_key(&column)
            };

            if free(&fields, Column::Date) && parse_date(text, self.config.date_locale).is_some() {
                fields.insert(Column::Date, text.to_string());
            } else if i == 0 && free(&fields, Column::Id) && ID_RE.is_match(text) {
                fields.insert(Column::Id, text.to_string());
            } else if free(&fields, Column::Age) && AGE_RE.is_match(text) {
                fields.insert(Column::Age, text.to_string());
            } else if free(&fields, Column::Gender) && self.looks_like_gender(text) {
                fields.insert(Column::Gender, text.to_string());
            } else {
                text_cells.push(text);
            }
        }

        let text_columns: Vec<Column> = columns
            .iter()
            .copied()
            .filter(|c| matches!(c, Column::Diagnosis | Column::Treatment))
            .collect();

        if text_cells.len() == 1
            && text_columns.contains(&Column::Treatment)
            && self.vocabulary.is_known_treatment(text_cells[0])
            && self.vocabulary.exact_diagnosis(text_cells[0]).is_none()
        {
            fields.insert(Column::Treatment, text_cells[0].to_string());
            return fields;
        }

        for (i, text) in text_cells.into_iter().enumerate() {
            match text_columns.get(i).or(text_columns.last()) {
                Some(column) => {
                    fields
                        .entry(*column)
                        .and_modify(|existing| {
                            existing.push(' ');
                            existing.push_str(text);
                        })
                        .or_insert_with(|| text.to_string());
                }
                None => trace!(cell = text, "No free text column for cell"),
            }
        }

        fields
    }

    /// Gender synonyms plus single letters, which the validator flags if unknown
    fn looks_like_gender(&self, text: &str) -> bool {
        let trimmed = text.trim().trim_end_matches('.');
        self.vocabulary.gender_for(trimmed).is_some()
            || (trimmed.chars().count() == 1 && trimmed.chars().all(char::is_alphabetic))
    }
}

/// Map each cell to the nearest learned column anchor
fn assign_by_anchor(cells: &[Cell], anchors: &[(Column, f32)]) -> HashMap<Column, String> {
    let mut fields: HashMap<Column, String> = HashMap::new();
    for cell in cells {
        let nearest = anchors
            .iter()
            .min_by(|a, b| {
                (a.1 - cell.center())
                    .abs()
                    .total_cmp(&(b.1 - cell.center()).abs())
            })
            .map(|(column, _)| *column);
        if let Some(column) = nearest {
            fields
                .entry(column)
                .and_modify(|existing| {
                    existing.push(' ');
                    existing.push_str(&cell.text);
                })
                .or_insert_with(|| cell.text.clone());
        }
    }
    fields
}

fn median_token_height(tokens: &[RawToken]) -> f32 {
    let mut heights: Vec<f32> = tokens
        .iter()
        .map(|t| t.bounding_box().height)
        .filter(|h| *h > 0.0)
        .collect();
    if heights.is_empty() {
        return 0.0;
    }
    heights.sort_by(|a, b| a.total_cmp(b));
    heights[heights.len() / 2]
}

/// Leading integer of an age cell such as "25", "25 ans" or "3a"
pub fn parse_age(text: &str) -> Option<u32> {
    AGE_RE
        .captures(text.trim())
        .and_then(|caps| caps[1].parse().ok())
}

/// Parse a register date.
///
/// ISO `yyyy-mm-dd` is always accepted. Numeric dates are read day first for
/// French registers and month first for English ones; when that reading is
/// impossible (month 13+) the other order is tried. Two-digit years map to
/// 2000-2069 / 1970-1999. Month names are recognized in both languages.
pub fn parse_date(text: &str, locale: DateLocale) -> Option<NaiveDate> {
    let text = text.trim();

    if let Some(caps) = ISO_DATE_RE.captures(text) {
        return NaiveDate::from_ymd_opt(
            caps[1].parse().ok()?,
            caps[2].parse().ok()?,
            caps[3].parse().ok()?,
        );
    }

    if let Some(caps) = NUMERIC_DATE_RE.captures(text) {
        let first: u32 = caps[1].parse().ok()?;
        let second: u32 = caps[2].parse().ok()?;
        let year = expand_year(&caps[3])?;
        let (day, month) = match locale {
            DateLocale::French => (first, second),
            DateLocale::English => (second, first),
        };
        return NaiveDate::from_ymd_opt(year, month, day)
            .or_else(|| NaiveDate::from_ymd_opt(year, day, month));
    }

    if let Some(caps) = DAY_MONTH_NAME_RE.captures(text) {
        let month = month_number(&caps[2])?;
        return NaiveDate::from_ymd_opt(caps[3].parse().ok()?, month, caps[1].parse().ok()?);
    }

    if let Some(caps) = MONTH_NAME_DAY_RE.captures(text) {
        let month = month_number(&caps[1])?;
        return NaiveDate::from_ymd_opt(caps[3].parse().ok()?, month, caps[2].parse().ok()?);
    }

    None
}

fn expand_year(text: &str) -> Option<i32> {
    let year: i32 = text.parse().ok()?;
    Some(match text.len() {
        2 if year < 70 => 2000 + year,
        2 => 1900 + year,
        _ => year,
    })
}

fn month_number(name: &str) -> Option<u32> {
    MONTH_NAMES.get(name.to_lowercase().as_str()).copied()
}
