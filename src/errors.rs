//! # Application Error Types
//!
//! This module defines common error types used throughout the register extraction crate.
//! Record-level data-quality problems are never errors: they are carried as
//! [`ValidationFlag`](crate::model::ValidationFlag)s on the records themselves.

use std::fmt;

/// General application error type for consistent error handling
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Configuration validation errors
    Config(String),
    /// Pipeline failures (image validation, recognizer, cancellation)
    Pipeline(String),
    /// Export serialization errors
    Export(String),
    /// Import / re-parse errors
    Import(String),
    /// File system errors
    FileSystem(String),
    /// Internal application errors
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "[CONFIG] {}", msg),
            AppError::Pipeline(msg) => write!(f, "[PIPELINE] {}", msg),
            AppError::Export(msg) => write!(f, "[EXPORT] {}", msg),
            AppError::Import(msg) => write!(f, "[IMPORT] {}", msg),
            AppError::FileSystem(msg) => write!(f, "[FILESYSTEM] {}", msg),
            AppError::Internal(msg) => write!(f, "[INTERNAL] {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<crate::pipeline_errors::PipelineError> for AppError {
    fn from(err: crate::pipeline_errors::PipelineError) -> Self {
        AppError::Pipeline(err.to_string())
    }
}

impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::Export(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Export(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::FileSystem(err.to_string())
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// Standardized error logging utilities for consistent error reporting across the crate
pub mod error_logging {
    use tracing::error;

    /// Log image validation failures with the input context
    pub fn log_image_error(
        error: &impl std::fmt::Display,
        operation: &str,
        image_size: Option<u64>,
        declared_mime: Option<&str>,
    ) {
        error!(
            error = %error,
            operation = %operation,
            image_size_bytes = ?image_size,
            declared_mime = ?declared_mime,
            "Image validation failed"
        );
    }

    /// Log recognizer failures with retry context
    pub fn log_recognition_error(
        error: &impl std::fmt::Display,
        operation: &str,
        recognizer: &str,
        attempt_count: Option<u32>,
        processing_duration: Option<std::time::Duration>,
    ) {
        error!(
            error = %error,
            operation = %operation,
            recognizer = %recognizer,
            attempt_count = ?attempt_count,
            processing_duration_ms = ?processing_duration.map(|d| d.as_millis()),
            "Field recognition failed"
        );
    }

    /// Log export and import errors with batch context
    pub fn log_export_error(
        error: &impl std::fmt::Display,
        operation: &str,
        provenance: Option<&str>,
        record_count: Option<usize>,
    ) {
        error!(
            error = %error,
            operation = %operation,
            provenance = ?provenance,
            record_count = ?record_count,
            "Export operation failed"
        );
    }

    /// Log file system errors with path and operation context
    pub fn log_filesystem_error(
        error: &impl std::fmt::Display,
        operation: &str,
        path: Option<&str>,
        file_size: Option<u64>,
    ) {
        error!(
            error = %error,
            operation = %operation,
            path = ?path,
            file_size_bytes = ?file_size,
            "File system operation failed"
        );
    }

    /// Log configuration errors during startup/initialization
    pub fn log_config_error(error: &impl std::fmt::Display, config_key: &str, operation: &str) {
        error!(
            error = %error,
            config_key = %config_key,
            operation = %operation,
            "Configuration error"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_errors::PipelineError;

    #[test]
    fn test_display_prefixes() {
        assert_eq!(
            AppError::Config("bad".to_string()).to_string(),
            "[CONFIG] bad"
        );
        assert_eq!(
            AppError::Import("oops".to_string()).to_string(),
            "[IMPORT] oops"
        );
    }

    #[test]
    fn test_pipeline_error_conversion() {
        let err: AppError = PipelineError::Cancelled.into();
        match err {
            AppError::Pipeline(msg) => assert!(msg.contains("CANCELLED")),
            other => panic!("unexpected conversion: {other:?}"),
        }
    }
}
