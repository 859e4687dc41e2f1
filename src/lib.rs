//! # Register Extract
//!
//! Turns photographed, handwritten health-centre registers into validated,
//! de-duplicated patient records with summary statistics, ready for CSV and
//! JSON export.
//!
//! The recognition model is pluggable behind [`recognizer::FieldRecognizer`];
//! everything around it lives here.

pub mod aggregation;
pub mod circuit_breaker;
pub mod config;
pub mod deduplication;
pub mod errors;
pub mod export;
pub mod model;
pub mod normalizer;
pub mod observability;
pub mod parser;
pub mod pipeline;
pub mod pipeline_errors;
pub mod recognizer;
pub mod similarity;
pub mod validator;
pub mod vocabulary;

// Re-export types for easier access
pub use config::AppConfig;
pub use model::{PatientRecord, RawToken, RegisterBatch, ValidationFlag};
pub use pipeline::{ExtractionResult, Pipeline};
