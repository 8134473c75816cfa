//! Pyramid builder.
//!
//! Derives one artifact per [`PyramidLevel`] from a source image. A level
//! whose max width is at least the native width is the source itself: no
//! upscaled copy is ever written. Narrower levels are downscaled with
//! Lanczos3 and encoded at the level's quality, once; later builds find them
//! on disk.
//!
//! A JPEG level too tall or wide for JPEG is written as PNG instead; the
//! format is chosen from the target size before any resampling.
//!
//! A level that fails to generate is left out of the [`Pyramid`] and the
//! failure is logged. [`PyramidBuilder::fallback_level`] serves the nearest
//! lower level in its place.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};

use super::encoder::{ArtifactEncoder, JPEG_MAX_DIMENSION};
use super::levels::{LevelSet, PyramidLevel};
use crate::cache::{ArtifactId, ArtifactOrigin, Materializer};
use crate::error::{EncodeError, ImageError};
use crate::key::OutputFormat;
use crate::source::{SourceImage, SourceRegistry};

/// One materialized pyramid level.
#[derive(Debug, Clone)]
pub struct LevelArtifact {
    pub level: String,
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub format: OutputFormat,
    pub data: Bytes,
    /// The level is the unmodified source image.
    pub reused_source: bool,
    pub origin: ArtifactOrigin,
}

impl LevelArtifact {
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// A level left out of a pyramid, with the reason.
#[derive(Debug, Clone)]
pub struct OmittedLevel {
    pub level: String,
    pub error: String,
}

/// The levels of one image that could be produced, in rank order.
#[derive(Debug, Clone, Default)]
pub struct Pyramid {
    levels: Vec<LevelArtifact>,
    omitted: Vec<OmittedLevel>,
}

impl Pyramid {
    pub fn get(&self, name: &str) -> Option<&LevelArtifact> {
        self.levels.iter().find(|l| l.level == name)
    }

    pub fn levels(&self) -> &[LevelArtifact] {
        &self.levels
    }

    pub fn omitted(&self) -> &[OmittedLevel] {
        &self.omitted
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Builds and memoizes pyramid levels.
pub struct PyramidBuilder {
    sources: Arc<SourceRegistry>,
    materializer: Arc<Materializer>,
    encoder: ArtifactEncoder,
    format: OutputFormat,
}

impl PyramidBuilder {
    pub fn new(sources: Arc<SourceRegistry>, materializer: Arc<Materializer>) -> Self {
        Self {
            sources,
            materializer,
            encoder: ArtifactEncoder::new(),
            format: OutputFormat::Jpeg,
        }
    }

    /// Encode generated levels in `format` instead of JPEG.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Materialize every level of `levels` for `image`.
    pub async fn build_pyramid(&self, image: &SourceImage, levels: &LevelSet) -> Pyramid {
        let mut pyramid = Pyramid::default();
        for level in levels.iter() {
            match self.build_level(image, level).await {
                Ok(artifact) => pyramid.levels.push(artifact),
                Err(e) => {
                    warn!(
                        key = %image.key(),
                        level = %level.name,
                        error = %e,
                        "Omitting pyramid level"
                    );
                    pyramid.omitted.push(OmittedLevel {
                        level: level.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        pyramid
    }

    /// Materialize a single level.
    pub async fn build_level(
        &self,
        image: &SourceImage,
        level: &PyramidLevel,
    ) -> Result<LevelArtifact, ImageError> {
        let (width, height) = level.target_dimensions(image.width(), image.height());

        if width == image.width() {
            let data = self.sources.source_bytes(image).await?;
            return Ok(LevelArtifact {
                level: level.name.clone(),
                width,
                height,
                quality: image.quality(),
                format: image.format(),
                data,
                reused_source: true,
                origin: ArtifactOrigin::Disk,
            });
        }

        let format = self.level_format(width, height);
        let id = ArtifactId::level(
            *image.key(),
            level.name.as_str(),
            width,
            height,
            level.quality,
            format,
        );
        let (data, origin) = self
            .materializer
            .get_or_create(&id, || self.render_level(image, level, format))
            .await?;

        if origin == ArtifactOrigin::Generated {
            info!(
                key = %image.key(),
                level = %level.name,
                width,
                height,
                format = %format,
                bytes = data.len(),
                "Generated pyramid level"
            );
        }
        Ok(LevelArtifact {
            level: level.name.clone(),
            width,
            height,
            quality: level.quality,
            format,
            data,
            reused_source: false,
            origin,
        })
    }

    /// The level called `name`, or the nearest lower level that can be
    /// produced.
    pub async fn fallback_level(
        &self,
        image: &SourceImage,
        levels: &LevelSet,
        name: &str,
    ) -> Result<LevelArtifact, ImageError> {
        let chain = levels
            .fallback_chain(name)
            .ok_or_else(|| ImageError::UnknownLevel {
                name: name.to_string(),
            })?;
        for level in chain {
            match self.build_level(image, level).await {
                Ok(artifact) => return Ok(artifact),
                Err(e) => warn!(
                    key = %image.key(),
                    level = %level.name,
                    error = %e,
                    "Level unavailable, trying the next lower level"
                ),
            }
        }
        Err(ImageError::LevelUnavailable {
            name: name.to_string(),
        })
    }

    /// The configured format, unless JPEG cannot hold `width` x `height`.
    fn level_format(&self, width: u32, height: u32) -> OutputFormat {
        if self.format == OutputFormat::Jpeg
            && (width > JPEG_MAX_DIMENSION || height > JPEG_MAX_DIMENSION)
        {
            OutputFormat::Png
        } else {
            self.format
        }
    }

    async fn render_level(
        &self,
        image: &SourceImage,
        level: &PyramidLevel,
        format: OutputFormat,
    ) -> Result<Bytes, ImageError> {
        let pixels = self.sources.pixels(image).await?;
        let encoder = self.encoder.clone();
        let (max_width, quality) = (level.max_width, level.quality);

        let encoded = tokio::task::spawn_blocking(move || match encoder.downscale(&pixels, max_width) {
            Some(scaled) => encoder.encode(&scaled, format, quality),
            None => encoder.encode(&pixels, format, quality),
        })
        .await
        .map_err(|e| EncodeError::Task(e.to_string()))??;
        Ok(encoded)
    }
}

// =============================================================================
// Tests
// =============================================================================
