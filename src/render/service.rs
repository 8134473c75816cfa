//! Render service: document bytes to a stored source image.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use image::DynamicImage;
use tracing::{debug, info, warn};

use super::converter::DocumentConverter;
use super::stitcher::{Stitcher, VerticalStitcher};
use super::{DocumentKind, RenderParams};
use crate::cache::{ArtifactId, ArtifactStore, Singleflight};
use crate::error::{ConversionError, EncodeError, StoreError};
use crate::key::{CacheKey, OutputFormat};
use crate::source::{SourceImage, SourceMetadata, SourceRegistry};
use crate::tile::ArtifactEncoder;

type RenderFlight = Result<(SourceImage, bool), ConversionError>;

/// Result of a render request.
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub image: SourceImage,
    /// `false` when an identical document had already been rendered.
    pub created: bool,
}

/// Converts, stitches, and stores documents, once per cache key.
pub struct RenderService {
    store: Arc<ArtifactStore>,
    sources: Arc<SourceRegistry>,
    converter: Arc<dyn DocumentConverter>,
    stitcher: Arc<dyn Stitcher>,
    encoder: ArtifactEncoder,
    flights: Singleflight<CacheKey, RenderFlight>,
}

impl RenderService {
    pub fn new(sources: Arc<SourceRegistry>, converter: Arc<dyn DocumentConverter>) -> Self {
        Self {
            store: sources.store().clone(),
            sources,
            converter,
            stitcher: Arc::new(VerticalStitcher),
            encoder: ArtifactEncoder::new(),
            flights: Singleflight::new(),
        }
    }

    pub fn with_stitcher(mut self, stitcher: Arc<dyn Stitcher>) -> Self {
        self.stitcher = stitcher;
        self
    }

    pub fn with_encoder(mut self, encoder: ArtifactEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn converter(&self) -> &Arc<dyn DocumentConverter> {
        &self.converter
    }

    /// Render `document` (named `filename`) with `params`, reusing a stored
    /// result for the same bytes and parameters.
    pub async fn render(
        &self,
        document: Bytes,
        filename: &str,
        params: RenderParams,
    ) -> Result<RenderOutcome, ConversionError> {
        params.validate()?;
        DocumentKind::from_filename(filename)?;

        let hashed = document.clone();
        let key = tokio::task::spawn_blocking(move || {
            CacheKey::for_document(&hashed, params.dpi, params.format, params.quality)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?;

        if let Some(image) = self.existing(&key).await? {
            debug!(key = %key, "Reusing rendered document");
            return Ok(RenderOutcome {
                image,
                created: false,
            });
        }

        let (image, created) = self
            .flights
            .run(key, || async move {
                if let Some(image) = self.existing(&key).await? {
                    return Ok((image, false));
                }
                let image = self.render_new(key, document, filename).await?;
                Ok((image, true))
            })
            .await?;
        Ok(RenderOutcome { image, created })
    }

    async fn existing(&self, key: &CacheKey) -> Result<Option<SourceImage>, ConversionError> {
        let Some(metadata) = self.store.read_metadata::<SourceMetadata>(key).await? else {
            return Ok(None);
        };
        let image = SourceImage::new(*key, metadata);
        if !self.store.exists(&image.artifact_id()).await {
            warn!(key = %key, "Metadata present without source artifact");
            return Ok(None);
        }
        self.sources.register(image.clone()).await;
        Ok(Some(image))
    }

    async fn render_new(
        &self,
        key: CacheKey,
        document: Bytes,
        filename: &str,
    ) -> Result<SourceImage, ConversionError> {
        let upload = write_upload(document, filename).await?;
        let pages = self.converter.convert(upload.path(), key.dpi()).await?;
        drop(upload);
        if pages.is_empty() {
            return Err(ConversionError::NoPages);
        }
        let page_count = pages.len() as u32;

        let stitcher = self.stitcher.clone();
        let encoder = self.encoder.clone();
        let (data, format, width, height) = tokio::task::spawn_blocking(move || {
            let stitched = stitcher.stitch(pages)?;
            let (data, format) = encode_source(&encoder, &stitched, key)?;
            Ok::<_, ConversionError>((data, format, stitched.width(), stitched.height()))
        })
        .await
        .map_err(|e| EncodeError::Task(e.to_string()))??;

        let metadata = SourceMetadata {
            width,
            height,
            format,
            byte_size: data.len() as u64,
            page_count,
            original_name: Some(filename.to_string()),
        };
        self.store
            .write(&ArtifactId::source(key, format), data)
            .await?;
        self.store.write_metadata(&key, &metadata).await?;

        info!(
            key = %key,
            width,
            height,
            pages = page_count,
            format = %format,
            "Rendered document"
        );
        let image = SourceImage::new(key, metadata);
        self.sources.register(image.clone()).await;
        Ok(image)
    }
}

/// Encode the stitched image in the key's format, falling back to PNG when
/// JPEG cannot hold it.
fn encode_source(
    encoder: &ArtifactEncoder,
    image: &DynamicImage,
    key: CacheKey,
) -> Result<(Bytes, OutputFormat), EncodeError> {
    match encoder.encode(image, key.format(), key.quality()) {
        Ok(data) => Ok((data, key.format())),
        Err(e) if key.format() == OutputFormat::Jpeg => {
            warn!(
                key = %key,
                width = image.width(),
                height = image.height(),
                error = %e,
                "JPEG encoding failed, storing source as PNG"
            );
            let data = encoder.encode(image, OutputFormat::Png, key.quality())?;
            Ok((data, OutputFormat::Png))
        }
        Err(e) => Err(e),
    }
}

/// Copy the upload to a temp file that keeps the document's extension, which
/// the converter needs.
async fn write_upload(
    document: Bytes,
    filename: &str,
) -> Result<tempfile::NamedTempFile, ConversionError> {
    let suffix = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();

    tokio::task::spawn_blocking(move || {
        let tmp_dir = std::env::temp_dir();
        let mut file = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(&suffix)
            .tempfile()
            .map_err(|e| StoreError::io(&tmp_dir, e))?;
        file.write_all(&document)
            .and_then(|_| file.flush())
            .map_err(|e| StoreError::io(file.path(), e))?;
        Ok::<_, ConversionError>(file)
    })
    .await
    .map_err(|e| StoreError::Task(e.to_string()))?
}
