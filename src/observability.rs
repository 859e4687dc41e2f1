//! # Observability Module
//!
//! Structured logging setup and the metric helpers used by the pipeline stages.
//!
//! The library only emits `metrics` events; installing a recorder/exporter is left
//! to the hosting application. Without a recorder every helper is a no-op.

use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::prelude::*;

use crate::config::ObservabilityConfig;
use crate::model::RegisterBatch;

/// Initialize structured logging.
///
/// JSON lines when `json_logs` is set or outside development, pretty output
/// otherwise. `RUST_LOG` directives are honoured on top of the configured level.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("register_extract={}", config.log_level.to_lowercase()).parse()?);

    if config.json_logs || !config.is_development() {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .try_init()?;
    }

    tracing::info!(
        environment = %config.environment,
        log_level = %config.log_level,
        json = config.json_logs,
        "Tracing initialized with structured logging"
    );
    Ok(())
}

/// Span covering one batch through all stages
pub fn pipeline_span(provenance: &str) -> tracing::Span {
    tracing::info_span!("register_batch", provenance = provenance, component = "pipeline")
}

/// Span for a single pipeline stage
pub fn stage_span(stage: &'static str) -> tracing::Span {
    tracing::info_span!("pipeline_stage", stage = stage, component = "pipeline")
}

/// Record how long a stage took
pub fn record_stage_duration(stage: &'static str, duration: Duration) {
    metrics::histogram!("register_stage_duration_seconds", "stage" => stage)
        .record(duration.as_secs_f64());
}

/// Record the outcome of a recognizer call including its retries
pub fn record_recognition_metrics(success: bool, attempts: u32, duration: Duration) {
    metrics::counter!("recognizer_calls_total", "result" => if success { "success" } else { "failure" })
        .increment(1);
    metrics::histogram!("recognizer_attempts").record(f64::from(attempts));
    metrics::histogram!("recognizer_duration_seconds").record(duration.as_secs_f64());
}

/// Update circuit breaker state metric
pub fn update_circuit_breaker_state(is_open: bool) {
    metrics::gauge!("recognizer_circuit_breaker_open").set(if is_open { 1.0 } else { 0.0 });
}

/// Record an image rejected before recognition
pub fn record_rejected_image(reason: &'static str) {
    metrics::counter!("register_rejected_images_total", "reason" => reason).increment(1);
}

/// Record the volume of a finished batch
pub fn record_batch_metrics(batch: &RegisterBatch, duplicates: usize) {
    let status = if batch.cancelled { "cancelled" } else { "complete" };
    metrics::counter!("register_batches_total", "status" => status).increment(1);
    metrics::counter!("register_records_total").increment(batch.records.len() as u64);
    metrics::counter!("register_skipped_rows_total").increment(batch.skipped_rows as u64);
    metrics::counter!("register_duplicates_total").increment(duplicates as u64);
}
