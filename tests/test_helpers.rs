//! # Test Helper Library
//!
//! Shared setup for the integration tests: in-memory register photos, token
//! builders laid out like a register table, and scripted recognizers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use register_extract::config::AppConfig;
use register_extract::model::{BoundingBox, RawToken};
use register_extract::normalizer::{NormalizedImage, RegisterImage};
use register_extract::pipeline::Pipeline;
use register_extract::recognizer::{FieldRecognizer, RecognitionError, ReplayRecognizer};

/// Left edge of each table column, wide enough that cells never merge
pub const COLUMN_X: [f32; 6] = [0.0, 100.0, 200.0, 300.0, 700.0, 1100.0];

/// Encode a PNG with a gradient so every `variant` yields different bytes
pub fn png_bytes(width: u32, height: u32, variant: u8) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x % 256) as u8,
            (y % 256) as u8,
            variant.wrapping_mul(37).wrapping_add((x / 7 % 50) as u8),
        ])
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("PNG encoding should succeed");
    bytes
}

/// Register photo large enough to pass the size floor
pub fn register_image(variant: u8) -> RegisterImage {
    RegisterImage::new(png_bytes(800, 600, variant)).with_mime("image/png")
}

pub fn token(line: usize, x: f32, text: &str, confidence: f32) -> RawToken {
    let width = text.chars().count() as f32 * 10.0;
    RawToken::new(
        text,
        BoundingBox::new(x, line as f32 * 40.0, width, 20.0),
        confidence,
        line,
    )
}

/// Tokens of one register line; empty cells produce no token
pub fn row(line: usize, cells: &[&str], confidence: f32) -> Vec<RawToken> {
    cells
        .iter()
        .zip(COLUMN_X)
        .filter(|(text, _)| !text.is_empty())
        .map(|(text, x)| token(line, x, text, confidence))
        .collect()
}

/// Tokens of several lines, numbered from `first_line`
pub fn table(first_line: usize, rows: &[&[&str]], confidence: f32) -> Vec<RawToken> {
    rows.iter()
        .enumerate()
        .flat_map(|(i, cells)| row(first_line + i, cells, confidence))
        .collect()
}

/// Defaults with millisecond backoff so retry tests stay fast
pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.recovery.base_retry_delay_ms = 1;
    config.recovery.max_retry_delay_ms = 4;
    config.recovery.operation_timeout_secs = 2;
    config
}

pub fn replay_pipeline(tokens: Vec<RawToken>) -> Pipeline {
    Pipeline::new(&fast_config(), Arc::new(ReplayRecognizer::new(tokens)))
        .expect("default configuration should be valid")
}

/// Recognizer answering from a fixed script, then failing as unavailable
pub struct ScriptedRecognizer {
    outcomes: Mutex<VecDeque<Result<Vec<RawToken>, RecognitionError>>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedRecognizer {
    pub fn new(outcomes: Vec<Result<Vec<RawToken>, RecognitionError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Wait before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FieldRecognizer for ScriptedRecognizer {
    async fn recognize(&self, _image: &NormalizedImage) -> Result<Vec<RawToken>, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(RecognitionError::Unavailable("script exhausted".to_string())))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
