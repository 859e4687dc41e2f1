//! # Image Normalization Module
//!
//! Validates and standardizes an uploaded register photo before recognition.
//!
//! ## Checks, in order
//!
//! 1. Byte size: empty input is invalid, anything above `max_bytes` is rejected
//! 2. Format: detected from magic bytes; only JPEG and PNG are accepted
//! 3. Decoding
//! 4. EXIF orientation (phone photos store rotation in tag 0x0112)
//! 5. Dimensions: hard floor rejects, recommended size only warns
//! 6. Optional contrast enhancement
//!
//! The SHA-256 of the original bytes becomes the batch provenance.

use std::io::Cursor;

use chrono::NaiveDate;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::ImageConfig;
use crate::errors::error_logging;
use crate::pipeline_errors::PipelineError;

/// Standard deviation of luma below which a page is reported as low contrast
const LOW_CONTRAST_STDDEV: f64 = 20.0;

/// An uploaded register image plus the optional metadata the caller knows
#[derive(Debug, Clone, Default)]
pub struct RegisterImage {
    pub bytes: Vec<u8>,
    pub declared_mime: Option<String>,
    pub center_name: Option<String>,
    pub batch_date: Option<NaiveDate>,
}

impl RegisterImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            ..Default::default()
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.declared_mime = Some(mime.into());
        self
    }

    pub fn with_center(mut self, center_name: impl Into<String>) -> Self {
        self.center_name = Some(center_name.into());
        self
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.batch_date = Some(date);
        self
    }
}

/// Non-fatal observations made while normalizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all_fields = "camelCase")]
pub enum NormalizationWarning {
    BelowRecommendedResolution {
        width: u32,
        height: u32,
        recommended_width: u32,
        recommended_height: u32,
    },
    MimeMismatch {
        declared: String,
        detected: String,
    },
    LowContrast {
        stddev: f64,
    },
}

/// Image ready for the recognizer
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub image: DynamicImage,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// EXIF orientation value that was applied (1 = none)
    pub orientation: u32,
    /// Lowercase hex SHA-256 of the original bytes
    pub checksum: String,
    pub byte_len: u64,
    pub warnings: Vec<NormalizationWarning>,
}

/// Validates uploads and produces [`NormalizedImage`]s
#[derive(Debug, Clone, Default)]
pub struct ImageNormalizer {
    config: ImageConfig,
}

impl ImageNormalizer {
    pub fn new(config: ImageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Validate and normalize an uploaded image.
    ///
    /// # Errors
    ///
    /// - `InvalidImage` - empty, undecodable, or not JPEG/PNG
    /// - `ImageTooLarge` - more than `max_bytes`
    /// - `ImageTooSmall` - below the hard dimension floor
    pub fn normalize(&self, input: &RegisterImage) -> Result<NormalizedImage, PipelineError> {
        let start_time = std::time::Instant::now();
        let result = self.normalize_inner(input);

        match &result {
            Ok(normalized) => info!(
                width = normalized.width,
                height = normalized.height,
                orientation = normalized.orientation,
                warnings = normalized.warnings.len(),
                duration_ms = start_time.elapsed().as_millis() as u64,
                "Image normalized"
            ),
            Err(err) => error_logging::log_image_error(
                err,
                "normalize_image",
                Some(input.bytes.len() as u64),
                input.declared_mime.as_deref(),
            ),
        }

        result
    }

    fn normalize_inner(&self, input: &RegisterImage) -> Result<NormalizedImage, PipelineError> {
        let bytes = &input.bytes;
        let byte_len = bytes.len() as u64;

        if bytes.is_empty() {
            return Err(PipelineError::InvalidImage("image is empty".to_string()));
        }
        if byte_len > self.config.max_bytes {
            return Err(PipelineError::ImageTooLarge {
                size: byte_len,
                max: self.config.max_bytes,
            });
        }

        let mut warnings = Vec::new();

        let declared = match input.declared_mime.as_deref() {
            Some(mime) => Some(declared_format(mime)?),
            None => None,
        };

        let format = image::guess_format(bytes).map_err(|e| {
            PipelineError::InvalidImage(format!("could not detect image format: {}", e))
        })?;
        if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
            return Err(PipelineError::InvalidImage(format!(
                "unsupported image format {:?}, expected JPEG or PNG",
                format
            )));
        }
        if let Some(declared) = declared {
            if declared != format {
                warn!(
                    "Declared MIME type {:?} does not match detected format {:?}, using detected format",
                    input.declared_mime, format
                );
                warnings.push(NormalizationWarning::MimeMismatch {
                    declared: input.declared_mime.clone().unwrap_or_default(),
                    detected: format!("{:?}", format),
                });
            }
        }

        let decoded = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| PipelineError::InvalidImage(format!("could not decode image: {}", e)))?;

        let orientation = exif_orientation_tag(bytes).unwrap_or(1);
        let oriented = Orientation::from_tag(orientation).apply(decoded);
        let (width, height) = oriented.dimensions();

        let (long_side, short_side) = (width.max(height), width.min(height));
        if long_side < self.config.min_width || short_side < self.config.min_height {
            return Err(PipelineError::ImageTooSmall {
                width,
                height,
                min_width: self.config.min_width,
                min_height: self.config.min_height,
            });
        }
        if long_side < self.config.recommended_width || short_side < self.config.recommended_height
        {
            debug!(
                "Image {}x{} is below the recommended {}x{}",
                width, height, self.config.recommended_width, self.config.recommended_height
            );
            warnings.push(NormalizationWarning::BelowRecommendedResolution {
                width,
                height,
                recommended_width: self.config.recommended_width,
                recommended_height: self.config.recommended_height,
            });
        }

        let stddev = luma_stddev(&oriented);
        if stddev < LOW_CONTRAST_STDDEV {
            warnings.push(NormalizationWarning::LowContrast { stddev });
        }

        let image = if self.config.enhance_contrast && self.config.contrast_amount != 0.0 {
            oriented.adjust_contrast(self.config.contrast_amount)
        } else {
            oriented
        };

        Ok(NormalizedImage {
            image,
            format,
            width,
            height,
            orientation,
            checksum: checksum(bytes),
            byte_len,
            warnings,
        })
    }
}

fn declared_format(mime: &str) -> Result<ImageFormat, PipelineError> {
    match mime.trim().to_lowercase().as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Ok(ImageFormat::Jpeg),
        "image/png" => Ok(ImageFormat::Png),
        other => Err(PipelineError::InvalidImage(format!(
            "declared MIME type '{}' is not supported, expected image/jpeg or image/png",
            other
        ))),
    }
}

/// Lowercase hex SHA-256 of the given bytes
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Raw EXIF orientation tag (0x0112) of the primary image, if any
pub fn exif_orientation_tag(bytes: &[u8]) -> Option<u32> {
    let metadata = exif::Reader::new()
        .read_from_container(&mut Cursor::new(bytes))
        .ok()?;
    let field = metadata.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    field.value.get_uint(0)
}

/// Upright transform for a stored orientation: clockwise quarter turns,
/// then an optional horizontal mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Orientation {
    pub quarter_turns: u8,
    pub mirrored: bool,
}

impl Orientation {
    /// Unknown or out-of-range tag values leave the image untouched
    pub fn from_tag(tag: u32) -> Self {
        let (quarter_turns, mirrored) = match tag {
            2 => (0, true),
            3 => (2, false),
            4 => (2, true),
            5 => (1, true),
            6 => (1, false),
            7 => (3, true),
            8 => (3, false),
            _ => (0, false),
        };
        Self {
            quarter_turns,
            mirrored,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.quarter_turns == 0 && !self.mirrored
    }

    /// Width and height trade places on odd quarter turns
    pub fn swaps_dimensions(&self) -> bool {
        self.quarter_turns % 2 == 1
    }

    pub fn apply(&self, image: DynamicImage) -> DynamicImage {
        let turned = match self.quarter_turns % 4 {
            1 => image.rotate90(),
            2 => image.rotate180(),
            3 => image.rotate270(),
            _ => image,
        };
        if self.mirrored {
            turned.fliph()
        } else {
            turned
        }
    }
}

fn luma_stddev(image: &DynamicImage) -> f64 {
    // A thumbnail is enough to judge global contrast
    let gray = image.thumbnail(256, 256).to_luma8();
    let count = (gray.width() as usize) * (gray.height() as usize);
    if count == 0 {
        return 0.0;
    }
    let mean = gray.pixels().map(|p| p.0[0] as f64).sum::<f64>() / count as f64;
    let variance = gray
        .pixels()
        .map(|p| {
            let d = p.0[0] as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / count as f64;
    variance.sqrt()
}
