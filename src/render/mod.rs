//! Document rendering.
//!
//! Turns an uploaded document into one tall source image:
//!
//! ```text
//! bytes ──► CacheKey (sha256 + params) ──► already stored? ──► reuse
//!                                              │ no
//!                                              ▼
//!        DocumentConverter (pages) ──► Stitcher ──► encode ──► ArtifactStore
//! ```
//!
//! Conversion itself is delegated to external tools behind the
//! [`DocumentConverter`] trait; stacking pages is the [`Stitcher`]'s job.

mod converter;
mod service;
mod stitcher;

pub use converter::{DocumentConverter, ExternalConverter, ToolStatus};
pub use service::{RenderOutcome, RenderService};
pub use stitcher::{Stitcher, VerticalStitcher};

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConversionError;
use crate::key::{OutputFormat, DEFAULT_DPI, MAX_DPI, MIN_DPI};

/// Quality used for stitched sources when none is given.
pub const DEFAULT_SOURCE_QUALITY: u8 = 85;

/// Extensions converted to PDF by the office converter before rasterizing.
pub const OFFICE_EXTENSIONS: &[&str] = &[
    "doc", "docx", "ppt", "pptx", "csv", "xls", "xlsx", "odt", "rtf", "txt", "psd", "cdr", "wps",
    "svg",
];

/// How a document reaches the rasterizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Office,
}

impl DocumentKind {
    /// Classify by file extension, case-insensitively.
    pub fn from_filename(name: &str) -> Result<Self, ConversionError> {
        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if extension == "pdf" {
            Ok(DocumentKind::Pdf)
        } else if OFFICE_EXTENSIONS.contains(&extension.as_str()) {
            Ok(DocumentKind::Office)
        } else {
            Err(ConversionError::UnsupportedFormat { extension })
        }
    }
}

/// Parameters that shape the stitched image and therefore its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderParams {
    pub dpi: u32,
    pub format: OutputFormat,
    pub quality: u8,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            dpi: DEFAULT_DPI,
            format: OutputFormat::Jpeg,
            quality: DEFAULT_SOURCE_QUALITY,
        }
    }
}

impl RenderParams {
    pub fn validate(&self) -> Result<(), ConversionError> {
        if !(MIN_DPI..=MAX_DPI).contains(&self.dpi) {
            return Err(ConversionError::InvalidParams(format!(
                "dpi must be between {} and {} (got {})",
                MIN_DPI, MAX_DPI, self.dpi
            )));
        }
        if self.quality == 0 || self.quality > 100 {
            return Err(ConversionError::InvalidParams(format!(
                "quality must be between 1 and 100 (got {})",
                self.quality
            )));
        }
        Ok(())
    }
}
