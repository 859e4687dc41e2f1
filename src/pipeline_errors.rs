//! # Pipeline Error Types Module
//!
//! Terminal failures of a single pipeline invocation. Only image validation and
//! unrecoverable recognizer failures (plus cooperative cancellation before
//! validation starts) prevent a batch result from being produced.

/// Terminal errors for one register image
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Input could not be decoded or is not a supported image
    InvalidImage(String),
    /// Image dimensions below the hard floor
    ImageTooSmall {
        width: u32,
        height: u32,
        min_width: u32,
        min_height: u32,
    },
    /// Image byte size above the configured maximum
    ImageTooLarge { size: u64, max: u64 },
    /// Recognizer backend not reachable (or circuit open)
    RecognitionUnavailable(String),
    /// Recognizer did not answer in time
    RecognitionTimeout(String),
    /// Recognizer admission control rejected the request
    RecognizerBusy(String),
    /// Cancelled before any record was validated
    Cancelled,
}

impl PipelineError {
    /// Whether the failure came from the external recognizer and may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::RecognitionUnavailable(_)
                | PipelineError::RecognitionTimeout(_)
                | PipelineError::RecognizerBusy(_)
        )
    }

    /// Whether the failure is an input validation failure
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidImage(_)
                | PipelineError::ImageTooSmall { .. }
                | PipelineError::ImageTooLarge { .. }
        )
    }

    /// Stable machine-readable code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidImage(_) => "InvalidImage",
            PipelineError::ImageTooSmall { .. } => "ImageTooSmall",
            PipelineError::ImageTooLarge { .. } => "ImageTooLarge",
            PipelineError::RecognitionUnavailable(_) => "RecognitionUnavailable",
            PipelineError::RecognitionTimeout(_) => "RecognitionTimeout",
            PipelineError::RecognizerBusy(_) => "RecognizerBusy",
            PipelineError::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::InvalidImage(msg) => {
                write!(f, "[INVALID_IMAGE] Image could not be used: {}", msg)
            }
            PipelineError::ImageTooSmall {
                width,
                height,
                min_width,
                min_height,
            } => write!(
                f,
                "[IMAGE_TOO_SMALL] Image is {}x{} pixels, minimum is {}x{}",
                width, height, min_width, min_height
            ),
            PipelineError::ImageTooLarge { size, max } => write!(
                f,
                "[IMAGE_TOO_LARGE] Image is {} bytes, maximum allowed is {} bytes",
                size, max
            ),
            PipelineError::RecognitionUnavailable(msg) => {
                write!(f, "[RECOGNITION_UNAVAILABLE] Field recognizer unavailable: {}", msg)
            }
            PipelineError::RecognitionTimeout(msg) => {
                write!(f, "[RECOGNITION_TIMEOUT] Field recognition timed out: {}", msg)
            }
            PipelineError::RecognizerBusy(msg) => {
                write!(f, "[RECOGNIZER_BUSY] Field recognizer is saturated: {}", msg)
            }
            PipelineError::Cancelled => {
                write!(f, "[CANCELLED] Batch cancelled before validation started")
            }
        }
    }
}

impl std::error::Error for PipelineError {}
