//! # Field Recognition Module
//!
//! The recognition model itself is an external capability. This module defines
//! the boundary it must implement ([`FieldRecognizer`]) and everything the
//! pipeline owns around it:
//!
//! - [`RecognitionClient`]: circuit breaker, per-call timeout, bounded retries
//!   with exponential backoff and jitter, cooperative cancellation
//! - [`AdmissionControlledRecognizer`]: queueing/backpressure for a shared backend
//! - [`ReplayRecognizer`]: deterministic recognizer replaying recorded tokens
//!
//! ## Retry policy
//!
//! | Failure       | Retries                          | Trips breaker |
//! |---------------|----------------------------------|---------------|
//! | `Unavailable` | `max_retries` (default 1)        | yes           |
//! | `Timeout`     | `max_retries` (default 1)        | yes           |
//! | `Busy`        | `busy_max_retries` (default 2)   | no            |

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::RecoveryConfig;
use crate::errors::{error_logging, AppError, AppResult};
use crate::model::RawToken;
use crate::normalizer::NormalizedImage;
use crate::observability;
use crate::pipeline_errors::PipelineError;

/// Failure reported by a recognizer backend
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionError {
    /// Model/backend not reachable
    Unavailable(String),
    /// Backend did not answer in time
    Timeout(String),
    /// Backend queue full or rate limited
    Busy(String),
}

impl std::fmt::Display for RecognitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecognitionError::Unavailable(msg) => write!(f, "[UNAVAILABLE] {}", msg),
            RecognitionError::Timeout(msg) => write!(f, "[TIMEOUT] {}", msg),
            RecognitionError::Busy(msg) => write!(f, "[BUSY] {}", msg),
        }
    }
}

impl std::error::Error for RecognitionError {}

impl From<RecognitionError> for PipelineError {
    fn from(err: RecognitionError) -> Self {
        match err {
            RecognitionError::Unavailable(msg) => PipelineError::RecognitionUnavailable(msg),
            RecognitionError::Timeout(msg) => PipelineError::RecognitionTimeout(msg),
            RecognitionError::Busy(msg) => PipelineError::RecognizerBusy(msg),
        }
    }
}

/// External recognition capability: image in, positioned text tokens out
#[async_trait]
pub trait FieldRecognizer: Send + Sync {
    async fn recognize(&self, image: &NormalizedImage) -> Result<Vec<RawToken>, RecognitionError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "recognizer"
    }
}

#[async_trait]
impl<T: FieldRecognizer + ?Sized> FieldRecognizer for Arc<T> {
    async fn recognize(&self, image: &NormalizedImage) -> Result<Vec<RawToken>, RecognitionError> {
        (**self).recognize(image).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Pipeline-side caller of a [`FieldRecognizer`]
pub struct RecognitionClient {
    recognizer: Arc<dyn FieldRecognizer>,
    recovery: RecoveryConfig,
    circuit_breaker: CircuitBreaker,
}

impl RecognitionClient {
    pub fn new(recognizer: Arc<dyn FieldRecognizer>, recovery: RecoveryConfig) -> Self {
        let circuit_breaker = CircuitBreaker::new(&recovery);
        Self {
            recognizer,
            recovery,
            circuit_breaker,
        }
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Recognize tokens with timeout, bounded retries and cancellation.
    ///
    /// # Errors
    ///
    /// - `RecognitionUnavailable` - backend unreachable after the retry, or circuit open
    /// - `RecognitionTimeout` - every allowed attempt timed out
    /// - `RecognizerBusy` - admission control kept rejecting after `busy_max_retries`
    /// - `Cancelled` - the token was cancelled while waiting
    pub async fn recognize(
        &self,
        image: &NormalizedImage,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawToken>, PipelineError> {
        let start_time = Instant::now();
        let name = self.recognizer.name().to_string();

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        if self.circuit_breaker.is_open() {
            warn!("Circuit breaker is open, rejecting recognition request for {name}");
            observability::update_circuit_breaker_state(true);
            return Err(PipelineError::RecognitionUnavailable(
                "recognizer temporarily disabled after repeated failures".to_string(),
            ));
        }

        let timeout = Duration::from_secs(self.recovery.operation_timeout_secs);
        let mut attempt: u32 = 0;
        let mut failure_retries: u32 = 0;
        let mut busy_retries: u32 = 0;

        loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Recognition cancelled during attempt {attempt}");
                    return Err(PipelineError::Cancelled);
                }
                result = tokio::time::timeout(timeout, self.recognizer.recognize(image)) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(RecognitionError::Timeout(format!(
                            "no answer within {} seconds",
                            self.recovery.operation_timeout_secs
                        ))),
                    }
                }
            };

            match outcome {
                Ok(tokens) => {
                    self.circuit_breaker.record_success();
                    observability::update_circuit_breaker_state(false);
                    observability::record_recognition_metrics(true, attempt, start_time.elapsed());
                    info!(
                        "Recognition succeeded on attempt {} in {}ms with {} tokens",
                        attempt,
                        start_time.elapsed().as_millis(),
                        tokens.len()
                    );
                    return Ok(tokens);
                }
                Err(err) => {
                    let retry_allowed = match err {
                        RecognitionError::Busy(_) => {
                            busy_retries += 1;
                            busy_retries <= self.recovery.busy_max_retries
                        }
                        RecognitionError::Unavailable(_) | RecognitionError::Timeout(_) => {
                            failure_retries += 1;
                            failure_retries <= self.recovery.max_retries
                        }
                    };

                    if !retry_allowed {
                        if !matches!(err, RecognitionError::Busy(_)) {
                            self.circuit_breaker.record_failure();
                            observability::update_circuit_breaker_state(
                                self.circuit_breaker.is_open(),
                            );
                        }
                        observability::record_recognition_metrics(
                            false,
                            attempt,
                            start_time.elapsed(),
                        );
                        error_logging::log_recognition_error(
                            &err,
                            "recognize_fields",
                            &name,
                            Some(attempt),
                            Some(start_time.elapsed()),
                        );
                        return Err(err.into());
                    }

                    let delay_ms = calculate_retry_delay(attempt, &self.recovery);
                    warn!("Recognition attempt {attempt} failed: {err}. Retrying in {delay_ms}ms");

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!("Recognition cancelled while backing off");
                            return Err(PipelineError::Cancelled);
                        }
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    }
                }
            }
        }
    }
}

/// Calculate retry delay with exponential backoff.
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay)
/// final_delay = delay + random(0..=delay/4)
/// ```
pub fn calculate_retry_delay(attempt: u32, recovery: &RecoveryConfig) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = recovery
        .base_retry_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(recovery.max_retry_delay_ms);

    // Jitter spreads concurrent batches hitting the same backend
    let jitter_cap = delay / 4;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rand::random_range(0..=jitter_cap)
    };
    delay + jitter
}

/// Admission control in front of a shared recognizer backend.
///
/// At most `max_in_flight` calls run at once and at most `max_queued` callers
/// wait for a slot; further callers are rejected with `Busy` right away.
pub struct AdmissionControlledRecognizer<R> {
    inner: R,
    permits: Semaphore,
    waiting: AtomicUsize,
    max_queued: usize,
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<R: FieldRecognizer> AdmissionControlledRecognizer<R> {
    pub fn new(inner: R, max_in_flight: usize, max_queued: usize) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_in_flight.max(1)),
            waiting: AtomicUsize::new(0),
            max_queued,
        }
    }

    /// Callers currently waiting for a slot
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<R: FieldRecognizer> FieldRecognizer for AdmissionControlledRecognizer<R> {
    async fn recognize(&self, image: &NormalizedImage) -> Result<Vec<RawToken>, RecognitionError> {
        if let Ok(_permit) = self.permits.try_acquire() {
            return self.inner.recognize(image).await;
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = WaitingGuard(&self.waiting);
        if queued >= self.max_queued {
            drop(guard);
            debug!("Admission queue full ({queued} waiting), rejecting request");
            return Err(RecognitionError::Busy(format!(
                "{} requests already waiting for {}",
                queued,
                self.inner.name()
            )));
        }

        let permit = self.permits.acquire().await;
        drop(guard);
        let _permit = permit
            .map_err(|_| RecognitionError::Unavailable("admission control closed".to_string()))?;
        self.inner.recognize(image).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Recognizer replaying a recorded token sequence
#[derive(Debug, Clone)]
pub struct ReplayRecognizer {
    tokens: Vec<RawToken>,
    name: String,
}

impl ReplayRecognizer {
    pub fn new(tokens: Vec<RawToken>) -> Self {
        Self {
            tokens,
            name: "replay".to_string(),
        }
    }

    /// Parse a JSON array of tokens
    pub fn from_json_str(json: &str) -> AppResult<Self> {
        let tokens: Vec<RawToken> = serde_json::from_str(json)
            .map_err(|e| AppError::Import(format!("Invalid token fixture: {}", e)))?;
        Ok(Self::new(tokens))
    }

    /// Load a JSON token fixture from disk
    pub fn from_json_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            error_logging::log_filesystem_error(
                &e,
                "read_token_fixture",
                path.to_str(),
                None,
            );
            AppError::FileSystem(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut recognizer = Self::from_json_str(&json)?;
        recognizer.name = format!("replay:{}", path.display());
        Ok(recognizer)
    }

    pub fn tokens(&self) -> &[RawToken] {
        &self.tokens
    }
}

#[async_trait]
impl FieldRecognizer for ReplayRecognizer {
    async fn recognize(&self, _image: &NormalizedImage) -> Result<Vec<RawToken>, RecognitionError> {
        Ok(self.tokens.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BoundingBox;
    use image::{DynamicImage, ImageFormat};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct ScriptedRecognizer {
        outcomes: Mutex<VecDeque<Result<Vec<RawToken>, RecognitionError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedRecognizer {
        fn new(outcomes: Vec<Result<Vec<RawToken>, RecognitionError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FieldRecognizer for ScriptedRecognizer {
        async fn recognize(
            &self,
            _image: &NormalizedImage,
        ) -> Result<Vec<RawToken>, RecognitionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(RecognitionError::Unavailable("script exhausted".into())))
        }
    }

    fn image() -> NormalizedImage {
        NormalizedImage {
            image: DynamicImage::new_rgb8(4, 4),
            format: ImageFormat::Png,
            width: 4,
            height: 4,
            orientation: 1,
            checksum: "test".to_string(),
            byte_len: 0,
            warnings: Vec::new(),
        }
    }

    fn fast_recovery() -> RecoveryConfig {
        RecoveryConfig {
            base_retry_delay_ms: 1,
            max_retry_delay_ms: 4,
            ..Default::default()
        }
    }

    fn token() -> RawToken {
        RawToken::new("001", BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.9, 0)
    }

    #[tokio::test]
    async fn test_single_retry_then_success() {
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![
            Err(RecognitionError::Unavailable("down".into())),
            Ok(vec![token()]),
        ]));
        let client = RecognitionClient::new(recognizer.clone(), fast_recovery());
        let tokens = client
            .recognize(&image(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_failure_is_terminal() {
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![
            Err(RecognitionError::Timeout("slow".into())),
            Err(RecognitionError::Unavailable("down".into())),
            Ok(vec![token()]),
        ]));
        let client = RecognitionClient::new(recognizer.clone(), fast_recovery());
        let err = client
            .recognize(&image(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RecognitionUnavailable(_)));
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.circuit_breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_busy_retries_are_bounded() {
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![
            Err(RecognitionError::Busy("queue full".into())),
            Err(RecognitionError::Busy("queue full".into())),
            Err(RecognitionError::Busy("queue full".into())),
            Ok(vec![token()]),
        ]));
        let client = RecognitionClient::new(recognizer.clone(), fast_recovery());
        let err = client
            .recognize(&image(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::RecognizerBusy(_)));
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 3);
        // Busy is backpressure, not a backend failure
        assert_eq!(client.circuit_breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![Ok(vec![token()])]));
        let client = RecognitionClient::new(recognizer.clone(), fast_recovery());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client.recognize(&image(), &cancel).await.unwrap_err();
        assert_eq!(err, PipelineError::Cancelled);
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_circuit_open_fails_fast() {
        let recovery = RecoveryConfig {
            circuit_breaker_threshold: 1,
            max_retries: 0,
            ..fast_recovery()
        };
        let recognizer = Arc::new(ScriptedRecognizer::new(vec![
            Err(RecognitionError::Unavailable("down".into())),
            Ok(vec![token()]),
        ]));
        let client = RecognitionClient::new(recognizer.clone(), recovery);
        let cancel = CancellationToken::new();
        assert!(client.recognize(&image(), &cancel).await.is_err());
        let err = client.recognize(&image(), &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::RecognitionUnavailable(_)));
        assert_eq!(recognizer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_delay_growth_and_cap() {
        let config = RecoveryConfig::default();
        let first = calculate_retry_delay(1, &config);
        assert!((500..=625).contains(&first));
        let second = calculate_retry_delay(2, &config);
        assert!((1000..=1250).contains(&second));
        let capped = calculate_retry_delay(20, &config);
        assert!((5000..=6250).contains(&capped));
    }

    #[test]
    fn test_retry_delay_without_jitter_room() {
        let config = RecoveryConfig {
            base_retry_delay_ms: 1,
            max_retry_delay_ms: 1,
            ..Default::default()
        };
        assert_eq!(calculate_retry_delay(3, &config), 1);
    }

    #[tokio::test]
    async fn test_admission_control_rejects_when_queue_full() {
        struct SlowRecognizer;

        #[async_trait]
        impl FieldRecognizer for SlowRecognizer {
            async fn recognize(
                &self,
                _image: &NormalizedImage,
            ) -> Result<Vec<RawToken>, RecognitionError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Vec::new())
            }
        }

        let gated = Arc::new(AdmissionControlledRecognizer::new(SlowRecognizer, 1, 0));
        let first = {
            let gated = gated.clone();
            tokio::spawn(async move { gated.recognize(&image()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = gated.recognize(&image()).await;
        assert!(matches!(second, Err(RecognitionError::Busy(_))));
        assert!(first.await.unwrap().is_ok());
        assert_eq!(gated.queued(), 0);
    }

    #[tokio::test]
    async fn test_replay_recognizer_from_json() {
        let json = r#"[{"text":"HTA","bounding_box":{"x":1.0,"y":2.0,"width":3.0,"height":4.0},"confidence":0.8,"line_index":2}]"#;
        let recognizer = ReplayRecognizer::from_json_str(json).unwrap();
        let tokens = recognizer.recognize(&image()).await.unwrap();
        assert_eq!(tokens[0].text(), "HTA");
        assert_eq!(tokens[0].line_index(), 2);
        assert!(ReplayRecognizer::from_json_str("not json").is_err());
    }
}
