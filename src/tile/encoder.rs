//! Bitmap encoding, decoding, and downscaling.
//!
//! Every artifact the system serves passes through [`ArtifactEncoder`]:
//! the stitched source, each pyramid level, and each tile.
//!
//! # Design Decisions
//!
//! - **JPEG drops alpha**: bitmaps that are not already grayscale or RGB are
//!   flattened to RGB before JPEG encoding.
//!
//! - **Bounded decode**: decoding uses an allocation limit so a corrupt or
//!   hostile file cannot exhaust memory.
//!
//! - **Never upscale**: [`ArtifactEncoder::downscale`] returns `None` when the
//!   bitmap is already narrow enough; callers reuse the original.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader, Limits};

use crate::error::EncodeError;
use crate::key::OutputFormat;

/// Default quality for tiles.
pub const DEFAULT_TILE_QUALITY: u8 = 90;

pub const MIN_QUALITY: u8 = 1;

pub const MAX_QUALITY: u8 = 100;

/// Largest width or height a JPEG can record.
pub const JPEG_MAX_DIMENSION: u32 = 65_535;

/// Default ceiling on memory allocated while decoding one image: 2 GiB.
pub const DEFAULT_MAX_DECODE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

// =============================================================================
// Encoder
// =============================================================================

/// Encodes bitmaps to JPEG or PNG and decodes stored artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactEncoder {
    max_decode_bytes: u64,
}

impl ArtifactEncoder {
    pub fn new() -> Self {
        Self::with_decode_limit(DEFAULT_MAX_DECODE_BYTES)
    }

    pub fn with_decode_limit(max_decode_bytes: u64) -> Self {
        Self { max_decode_bytes }
    }

    /// Encode `img` in `format`. Quality applies to JPEG only and is clamped
    /// to 1-100.
    pub fn encode(
        &self,
        img: &DynamicImage,
        format: OutputFormat,
        quality: u8,
    ) -> Result<Bytes, EncodeError> {
        let mut output = Vec::new();
        let result = match format {
            OutputFormat::Jpeg => {
                if img.width() > JPEG_MAX_DIMENSION || img.height() > JPEG_MAX_DIMENSION {
                    return Err(EncodeError::Encode {
                        format: format.to_string(),
                        message: format!(
                            "{}x{} exceeds the JPEG limit of {} pixels per side",
                            img.width(),
                            img.height(),
                            JPEG_MAX_DIMENSION
                        ),
                    });
                }
                let encoder = JpegEncoder::new_with_quality(&mut output, clamp_quality(quality));
                match img {
                    DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_) => {
                        img.write_with_encoder(encoder)
                    }
                    _ => DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder),
                }
            }
            OutputFormat::Png => img.write_with_encoder(PngEncoder::new(&mut output)),
        };

        result.map_err(|e| EncodeError::Encode {
            format: format.to_string(),
            message: e.to_string(),
        })?;
        Ok(Bytes::from(output))
    }

    /// Decode an encoded artifact, guessing its format from the bytes.
    pub fn decode(&self, data: &[u8]) -> Result<DynamicImage, EncodeError> {
        let mut reader = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| EncodeError::Decode {
                message: e.to_string(),
            })?;
        reader.limits(self.limits());
        reader.decode().map_err(|e| EncodeError::Decode {
            message: e.to_string(),
        })
    }

    /// Read pixel dimensions from the header without decoding.
    pub fn dimensions(&self, data: &[u8]) -> Result<(u32, u32), EncodeError> {
        ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| EncodeError::Decode {
                message: e.to_string(),
            })?
            .into_dimensions()
            .map_err(|e| EncodeError::Decode {
                message: e.to_string(),
            })
    }

    /// Shrink `img` to `max_width`, preserving aspect ratio with Lanczos3.
    ///
    /// Returns `None` when the image is already `max_width` or narrower.
    pub fn downscale(&self, img: &DynamicImage, max_width: u32) -> Option<DynamicImage> {
        if img.width() <= max_width {
            return None;
        }
        let height = scaled_height(img.width(), img.height(), max_width);
        Some(img.resize_exact(max_width, height, FilterType::Lanczos3))
    }

    fn limits(&self) -> Limits {
        let mut limits = Limits::default();
        limits.max_alloc = Some(self.max_decode_bytes);
        limits
    }
}

impl Default for ArtifactEncoder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Height of an image of `width`x`height` scaled to `target_width`,
/// rounded to the nearest pixel and never zero.
pub fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    if width == 0 {
        return height.max(1);
    }
    let scaled = (u64::from(height) * u64::from(target_width) + u64::from(width) / 2)
        / u64::from(width);
    scaled.clamp(1, u64::from(u32::MAX)) as u32
}

#[inline]
pub fn is_valid_quality(quality: u32) -> bool {
    (u32::from(MIN_QUALITY)..=u32::from(MAX_QUALITY)).contains(&quality)
}

#[inline]
pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_QUALITY, MAX_QUALITY)
}

// =============================================================================
// Tests
// =============================================================================
