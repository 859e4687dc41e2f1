//! # Unified Pipeline Configuration
//!
//! This module provides a centralized configuration system that consolidates
//! all pipeline settings into a single, structured configuration object.
//! It supports loading from environment variables or JSON, validation, and
//! provides defaults that match the recommended capture guidelines for
//! paper registers (10 MB max, 1920x1080 recommended, 400x400 floor).

use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::env;

pub const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024; // 10MB limit for register photos
pub const DEFAULT_MIN_DIMENSION: u32 = 400;
pub const RECOMMENDED_WIDTH: u32 = 1920;
pub const RECOMMENDED_HEIGHT: u32 = 1080;

/// Image acceptance limits and normalization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Maximum accepted image size in bytes
    pub max_bytes: u64,
    /// Hard floor, long side
    pub min_width: u32,
    /// Hard floor, short side
    pub min_height: u32,
    /// Soft recommendation, long side
    pub recommended_width: u32,
    /// Soft recommendation, short side
    pub recommended_height: u32,
    /// Whether to apply contrast enhancement after orientation
    pub enhance_contrast: bool,
    /// Contrast adjustment passed to the image crate (positive increases contrast)
    pub contrast_amount: f32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_bytes: MAX_IMAGE_BYTES,
            min_width: DEFAULT_MIN_DIMENSION,
            min_height: DEFAULT_MIN_DIMENSION,
            recommended_width: RECOMMENDED_WIDTH,
            recommended_height: RECOMMENDED_HEIGHT,
            enhance_contrast: true,
            contrast_amount: 15.0,
        }
    }
}

impl ImageConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.max_bytes == 0 {
            return Err(AppError::Config(
                "max_bytes must be greater than 0".to_string(),
            ));
        }
        if self.min_width == 0 || self.min_height == 0 {
            return Err(AppError::Config(
                "minimum image dimensions must be greater than 0".to_string(),
            ));
        }
        if self.min_height > self.min_width {
            return Err(AppError::Config(format!(
                "min_height ({}) is the short side and must not exceed min_width ({})",
                self.min_height, self.min_width
            )));
        }
        if self.recommended_width < self.min_width || self.recommended_height < self.min_height {
            return Err(AppError::Config(format!(
                "recommended dimensions ({}x{}) must not be below the hard floor ({}x{})",
                self.recommended_width, self.recommended_height, self.min_width, self.min_height
            )));
        }
        if !(-100.0..=100.0).contains(&self.contrast_amount) {
            return Err(AppError::Config(format!(
                "contrast_amount ({}) must be between -100 and 100",
                self.contrast_amount
            )));
        }
        Ok(())
    }
}

/// Recovery configuration for recognizer calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Retries after an unavailable/timeout failure
    pub max_retries: u32,
    /// Retries after the recognizer reported it is busy
    pub busy_max_retries: u32,
    /// Base delay between retries in milliseconds
    pub base_retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_retry_delay_ms: u64,
    /// Timeout for a single recognizer call in seconds
    pub operation_timeout_secs: u64,
    /// Circuit breaker failure threshold
    pub circuit_breaker_threshold: u32,
    /// Circuit breaker reset timeout in seconds
    pub circuit_breaker_reset_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            busy_max_retries: 2,
            base_retry_delay_ms: 500,
            max_retry_delay_ms: 5000,
            operation_timeout_secs: 30,
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_secs: 60,
        }
    }
}

impl RecoveryConfig {
    /// Validate recovery configuration parameters
    pub fn validate(&self) -> AppResult<()> {
        if self.max_retries > 3 {
            return Err(AppError::Config(format!(
                "max_retries ({}) must stay a small bounded number (<= 3)",
                self.max_retries
            )));
        }
        if self.busy_max_retries > 5 {
            return Err(AppError::Config(format!(
                "busy_max_retries ({}) must stay a small bounded number (<= 5)",
                self.busy_max_retries
            )));
        }
        if self.base_retry_delay_ms == 0 {
            return Err(AppError::Config(
                "base_retry_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(AppError::Config(format!(
                "max_retry_delay_ms ({}) must be >= base_retry_delay_ms ({})",
                self.max_retry_delay_ms, self.base_retry_delay_ms
            )));
        }
        if self.operation_timeout_secs == 0 {
            return Err(AppError::Config(
                "operation_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker_threshold must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker_reset_secs == 0 {
            return Err(AppError::Config(
                "circuit_breaker_reset_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Register columns the parser knows how to fill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Column {
    Id,
    Age,
    Gender,
    Diagnosis,
    Treatment,
    Date,
}

/// Date reading convention of the register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateLocale {
    /// Day first (15/01/2024), French month names
    #[default]
    French,
    /// Month first (01/15/2024), English month names
    English,
}

/// Layout heuristics for turning tokens into rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Expected column order when no header row is found
    pub columns: Vec<Column>,
    pub date_locale: DateLocale,
    /// Tokens closer than this multiple of the median token height join one cell
    pub cell_gap_ratio: f32,
    /// Lines whose mean confidence is below this are treated as noise
    pub noise_confidence_floor: f32,
    /// Header keyword cells needed to recognize a header line
    pub min_header_matches: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            columns: vec![
                Column::Id,
                Column::Age,
                Column::Gender,
                Column::Diagnosis,
                Column::Treatment,
            ],
            date_locale: DateLocale::French,
            cell_gap_ratio: 1.2,
            noise_confidence_floor: 0.3,
            min_header_matches: 2,
        }
    }
}

impl ParserConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.columns.is_empty() {
            return Err(AppError::Config("columns cannot be empty".to_string()));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].contains(column) {
                return Err(AppError::Config(format!(
                    "column {:?} is listed more than once",
                    column
                )));
            }
        }
        if self.cell_gap_ratio <= 0.0 {
            return Err(AppError::Config(
                "cell_gap_ratio must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.noise_confidence_floor) {
            return Err(AppError::Config(format!(
                "noise_confidence_floor ({}) must be between 0.0 and 1.0",
                self.noise_confidence_floor
            )));
        }
        if self.min_header_matches == 0 {
            return Err(AppError::Config(
                "min_header_matches must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Field-level validation rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_age: u32,
    /// Maximum edit distance for fuzzy diagnosis matching
    pub max_edit_distance: usize,
    /// Shorter inputs only match exactly
    pub min_fuzzy_length: usize,
    /// Records below this confidence get a `LowConfidence` flag
    pub low_confidence_threshold: f32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_age: 130,
            max_edit_distance: 2,
            min_fuzzy_length: 4,
            low_confidence_threshold: 0.6,
        }
    }
}

impl ValidationConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.max_age == 0 || self.max_age > 130 {
            return Err(AppError::Config(format!(
                "max_age ({}) must be between 1 and 130",
                self.max_age
            )));
        }
        if self.max_edit_distance > 3 {
            return Err(AppError::Config(format!(
                "max_edit_distance ({}) above 3 produces false positives",
                self.max_edit_distance
            )));
        }
        if !(0.0..=1.0).contains(&self.low_confidence_threshold) {
            return Err(AppError::Config(format!(
                "low_confidence_threshold ({}) must be between 0.0 and 1.0",
                self.low_confidence_threshold
            )));
        }
        Ok(())
    }
}

/// Duplicate detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicationConfig {
    /// Minimum normalized treatment similarity for composite-key duplicates
    pub treatment_similarity_threshold: f64,
    /// Whether equal explicit patient identifiers mark duplicates
    pub match_patient_ids: bool,
    /// Prior batches kept in the rolling comparison window
    pub window_size: usize,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            treatment_similarity_threshold: 0.85,
            match_patient_ids: true,
            window_size: 3,
        }
    }
}

impl DeduplicationConfig {
    pub fn validate(&self) -> AppResult<()> {
        if !(0.0..=1.0).contains(&self.treatment_similarity_threshold) {
            return Err(AppError::Config(format!(
                "treatment_similarity_threshold ({}) must be between 0.0 and 1.0",
                self.treatment_similarity_threshold
            )));
        }
        if self.window_size > 32 {
            return Err(AppError::Config(format!(
                "window_size ({}) must stay small (<= 32)",
                self.window_size
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Environment name (development, staging, production)
    pub environment: String,
    /// Log level for this crate
    pub log_level: String,
    /// Emit JSON log lines instead of pretty output
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> AppResult<()> {
        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(AppError::Config(format!(
                "log_level '{}' must be one of trace, debug, info, warn, error",
                other
            ))),
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub image: ImageConfig,
    pub recovery: RecoveryConfig,
    pub parser: ParserConfig,
    pub validation: ValidationConfig,
    pub deduplication: DeduplicationConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from `REGISTER_*` environment variables, falling back to defaults
    pub fn from_env() -> AppResult<Self> {
        let mut config = Self::default();

        config.image.max_bytes = env_or("REGISTER_MAX_IMAGE_BYTES", config.image.max_bytes)?;
        config.image.min_width = env_or("REGISTER_MIN_WIDTH", config.image.min_width)?;
        config.image.min_height = env_or("REGISTER_MIN_HEIGHT", config.image.min_height)?;
        config.image.enhance_contrast =
            env_or("REGISTER_ENHANCE_CONTRAST", config.image.enhance_contrast)?;

        config.recovery.max_retries =
            env_or("REGISTER_RECOGNIZER_MAX_RETRIES", config.recovery.max_retries)?;
        config.recovery.busy_max_retries = env_or(
            "REGISTER_RECOGNIZER_BUSY_RETRIES",
            config.recovery.busy_max_retries,
        )?;
        config.recovery.operation_timeout_secs = env_or(
            "REGISTER_RECOGNIZER_TIMEOUT_SECS",
            config.recovery.operation_timeout_secs,
        )?;

        config.parser.date_locale = match env::var("REGISTER_DATE_LOCALE") {
            Ok(value) => match value.to_lowercase().as_str() {
                "fr" | "french" => DateLocale::French,
                "en" | "english" => DateLocale::English,
                other => {
                    return Err(AppError::Config(format!(
                        "REGISTER_DATE_LOCALE must be 'fr' or 'en', got '{}'",
                        other
                    )))
                }
            },
            Err(_) => config.parser.date_locale,
        };

        config.validation.max_edit_distance = env_or(
            "REGISTER_MAX_EDIT_DISTANCE",
            config.validation.max_edit_distance,
        )?;
        config.deduplication.treatment_similarity_threshold = env_or(
            "REGISTER_TREATMENT_SIMILARITY",
            config.deduplication.treatment_similarity_threshold,
        )?;
        config.deduplication.window_size =
            env_or("REGISTER_DEDUP_WINDOW", config.deduplication.window_size)?;

        config.observability.environment =
            env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        config.observability.log_level =
            env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        config.observability.json_logs = env::var("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(config)
    }

    /// Parse a JSON configuration document; missing sections use defaults
    pub fn from_json_str(json: &str) -> AppResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| AppError::Config(format!("Invalid configuration JSON: {}", e)))
    }

    /// Validate all configuration sections
    pub fn validate(&self) -> AppResult<()> {
        self.image.validate()?;
        self.recovery.validate()?;
        self.parser.validate()?;
        self.validation.validate()?;
        self.deduplication.validate()?;
        self.observability.validate()?;
        Ok(())
    }

    /// Get a summary of the current configuration for logging
    pub fn summary(&self) -> String {
        format!(
            "Configuration: max_image_bytes={}, floor={}x{}, recognizer_retries={}/{}, date_locale={:?}, edit_distance={}, treatment_similarity={}",
            self.image.max_bytes,
            self.image.min_width,
            self.image.min_height,
            self.recovery.max_retries,
            self.recovery.busy_max_retries,
            self.parser.date_locale,
            self.validation.max_edit_distance,
            self.deduplication.treatment_similarity_threshold
        )
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> AppResult<T> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} has an invalid value: '{}'", key, value))),
        Err(_) => Ok(default),
    }
}
