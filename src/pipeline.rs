//! # Extraction Pipeline
//!
//! Runs the stages in strict order for one register image:
//!
//! ```text
//! normalize → recognize → parse → validate → deduplicate → aggregate
//! ```
//!
//! The recognizer call is the only suspension point. A [`Pipeline`] holds no
//! per-batch state, so one instance can serve many images concurrently; each
//! call returns its own [`ExtractionResult`].
//!
//! ## Cancellation
//!
//! - before validation starts: the call returns `PipelineError::Cancelled`
//! - once validation started: remaining stages are skipped, every record is
//!   flagged `Cancelled`, and the partial batch is still returned with statistics

use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::aggregation::{aggregate, AggregateStats, AggregationOptions};
use crate::config::AppConfig;
use crate::deduplication::{BatchWindow, DeduplicationEngine};
use crate::errors::{error_logging, AppResult};
use crate::model::{RawToken, RegisterBatch};
use crate::normalizer::{ImageNormalizer, NormalizationWarning, RegisterImage};
use crate::observability;
use crate::parser::RecordParser;
use crate::pipeline_errors::PipelineError;
use crate::recognizer::{FieldRecognizer, RecognitionClient};
use crate::validator::RecordValidator;
use crate::vocabulary::MedicalVocabulary;

/// Everything produced for one image
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub batch: RegisterBatch,
    pub statistics: AggregateStats,
    /// Soft image quality warnings from normalization
    pub warnings: Vec<NormalizationWarning>,
}

impl ExtractionResult {
    /// True when cancellation cut the batch short
    pub fn is_partial(&self) -> bool {
        self.batch.cancelled
    }
}

/// Configured stage chain
pub struct Pipeline {
    normalizer: ImageNormalizer,
    recognizer: RecognitionClient,
    parser: RecordParser,
    validator: RecordValidator,
    deduplicator: DeduplicationEngine,
    aggregation: AggregationOptions,
}

impl Pipeline {
    /// Build a pipeline with the built-in medical vocabulary
    pub fn new(config: &AppConfig, recognizer: Arc<dyn FieldRecognizer>) -> AppResult<Self> {
        Self::with_vocabulary(config, recognizer, MedicalVocabulary::builtin())
    }

    /// Build a pipeline with a custom vocabulary
    pub fn with_vocabulary(
        config: &AppConfig,
        recognizer: Arc<dyn FieldRecognizer>,
        vocabulary: MedicalVocabulary,
    ) -> AppResult<Self> {
        config.validate().inspect_err(|e| {
            error_logging::log_config_error(e, "pipeline", "build_pipeline");
        })?;
        debug!("{}", config.summary());

        let vocabulary = Arc::new(vocabulary);
        Ok(Self {
            normalizer: ImageNormalizer::new(config.image.clone()),
            recognizer: RecognitionClient::new(recognizer, config.recovery.clone()),
            parser: RecordParser::new(config.parser.clone(), Arc::clone(&vocabulary)),
            validator: RecordValidator::new(config.validation.clone(), vocabulary),
            deduplicator: DeduplicationEngine::new(config.deduplication.clone()),
            aggregation: AggregationOptions {
                confidence_threshold: config.validation.low_confidence_threshold,
                ..Default::default()
            },
        })
    }

    /// Replace the aggregation options used for the returned statistics
    pub fn with_aggregation(mut self, options: AggregationOptions) -> Self {
        self.aggregation = options;
        self
    }

    pub fn aggregation_options(&self) -> &AggregationOptions {
        &self.aggregation
    }

    /// Process one image without a cross-batch window
    pub async fn process(
        &self,
        image: RegisterImage,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult, PipelineError> {
        self.process_with_window(image, None, cancel).await
    }

    /// Process one image, also checking duplicates against prior batches
    pub async fn process_with_window(
        &self,
        image: RegisterImage,
        window: Option<&BatchWindow>,
        cancel: &CancellationToken,
    ) -> Result<ExtractionResult, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let stage_start = Instant::now();
        let normalized = {
            let _span = observability::stage_span("normalize").entered();
            self.normalizer
                .normalize(&image)
                .inspect_err(|e| observability::record_rejected_image(e.code()))?
        };
        observability::record_stage_duration("normalize", stage_start.elapsed());

        let provenance = normalized.checksum.clone();
        let warnings = normalized.warnings.clone();
        let span = observability::pipeline_span(&provenance);

        async move {
            let stage_start = Instant::now();
            let tokens = self
                .recognizer
                .recognize(&normalized, cancel)
                .instrument(observability::stage_span("recognize"))
                .await?;
            observability::record_stage_duration("recognize", stage_start.elapsed());
            drop(normalized);

            if cancel.is_cancelled() {
                info!("Batch cancelled after recognition, before validation");
                return Err(PipelineError::Cancelled);
            }

            let batch = self.parse_tokens(&tokens, provenance, image.center_name, image.batch_date);

            if cancel.is_cancelled() {
                info!("Batch cancelled after parsing, before validation");
                return Err(PipelineError::Cancelled);
            }

            let mut result = self.finish_batch(batch, window, cancel);
            result.warnings = warnings;
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Parse recognizer tokens into an unvalidated batch.
    ///
    /// Caller metadata wins over metadata read from the page preamble.
    pub fn parse_tokens(
        &self,
        tokens: &[RawToken],
        provenance: impl Into<String>,
        center_name: Option<String>,
        batch_date: Option<NaiveDate>,
    ) -> RegisterBatch {
        let stage_start = Instant::now();
        let _span = observability::stage_span("parse").entered();

        let parsed = self.parser.parse(tokens, batch_date);
        let mut batch = RegisterBatch::new(provenance);
        batch.center_name = center_name.or(parsed.center_name);
        batch.batch_date = batch_date.or(parsed.batch_date);
        batch.records = parsed.records;
        batch.skipped_rows = parsed.skipped_rows;

        observability::record_stage_duration("parse", stage_start.elapsed());
        batch
    }

    /// Validate, deduplicate and aggregate a parsed batch.
    ///
    /// Cancellation observed here keeps the work done so far: the batch is
    /// marked cancelled and statistics are computed over what exists.
    pub fn finish_batch(
        &self,
        mut batch: RegisterBatch,
        window: Option<&BatchWindow>,
        cancel: &CancellationToken,
    ) -> ExtractionResult {
        let mut cancelled = false;

        let stage_start = Instant::now();
        {
            let _span = observability::stage_span("validate").entered();
            for record in &mut batch.records {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                self.validator.validate_in_place(record);
            }
        }
        observability::record_stage_duration("validate", stage_start.elapsed());

        let mut duplicates = 0;
        if !cancelled && !cancel.is_cancelled() {
            let stage_start = Instant::now();
            let _span = observability::stage_span("deduplicate").entered();
            duplicates = self.deduplicator.deduplicate(&mut batch, window).duplicates_marked;
            observability::record_stage_duration("deduplicate", stage_start.elapsed());
        } else {
            cancelled = true;
        }

        if cancelled {
            warn!(
                records = batch.records.len(),
                "Batch cancelled during validation, returning partial records"
            );
            batch.mark_cancelled();
        }

        let stage_start = Instant::now();
        let statistics = {
            let _span = observability::stage_span("aggregate").entered();
            aggregate(&batch, &self.aggregation)
        };
        observability::record_stage_duration("aggregate", stage_start.elapsed());
        observability::record_batch_metrics(&batch, duplicates);

        info!(
            provenance = %batch.provenance,
            records = batch.records.len(),
            skipped_rows = batch.skipped_rows,
            duplicates,
            cancelled = batch.cancelled,
            "Batch processed"
        );

        ExtractionResult {
            batch,
            statistics,
            warnings: Vec::new(),
        }
    }

    /// Recompute statistics for a batch with other options
    pub fn aggregate(&self, batch: &RegisterBatch, options: &AggregationOptions) -> AggregateStats {
        aggregate(batch, options)
    }
}
