//! Document to page-bitmap conversion.
//!
//! [`ExternalConverter`] shells out to two tools:
//!
//! - `pdftoppm` (poppler) rasterizes PDF pages to PNG at the requested DPI
//! - `soffice --headless` turns office documents into PDF first
//!
//! Both run in a scratch directory that is removed when conversion ends.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::DynamicImage;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::DocumentKind;
use crate::error::{ConversionError, EncodeError, StoreError};
use crate::tile::ArtifactEncoder;

/// Turns a document on disk into its pages, in order.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, path: &Path, dpi: u32) -> Result<Vec<DynamicImage>, ConversionError>;

    /// Report whether the tools this converter needs can be launched.
    async fn check_available(&self) -> Vec<ToolStatus> {
        Vec::new()
    }
}

/// Availability of one external tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub tool: String,
    pub available: bool,
    pub detail: String,
}

/// Converter backed by `pdftoppm` and `soffice`.
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    pdftoppm: PathBuf,
    soffice: PathBuf,
    encoder: ArtifactEncoder,
}

impl Default for ExternalConverter {
    fn default() -> Self {
        Self::new("pdftoppm", "soffice")
    }
}

impl ExternalConverter {
    pub fn new(pdftoppm: impl Into<PathBuf>, soffice: impl Into<PathBuf>) -> Self {
        Self {
            pdftoppm: pdftoppm.into(),
            soffice: soffice.into(),
            encoder: ArtifactEncoder::new(),
        }
    }

    pub fn with_encoder(mut self, encoder: ArtifactEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    async fn office_to_pdf(&self, path: &Path, scratch: &Path) -> Result<PathBuf, ConversionError> {
        let args: [&OsStr; 5] = [
            OsStr::new("--headless"),
            OsStr::new("--convert-to"),
            OsStr::new("pdf"),
            OsStr::new("--outdir"),
            scratch.as_os_str(),
        ];
        run_tool(&self.soffice, args.iter().copied().chain([path.as_os_str()])).await?;

        let mut file_name = path.file_stem().unwrap_or_default().to_os_string();
        file_name.push(".pdf");
        let pdf = scratch.join(file_name);
        if !tokio::fs::try_exists(&pdf).await.unwrap_or(false) {
            return Err(ConversionError::ConverterFailed {
                tool: self.soffice.display().to_string(),
                status: "ok".to_string(),
                stderr: format!("expected output {} was not produced", pdf.display()),
            });
        }
        Ok(pdf)
    }

    async fn rasterize(
        &self,
        pdf: &Path,
        dpi: u32,
        scratch: &Path,
    ) -> Result<Vec<PathBuf>, ConversionError> {
        let resolution = dpi.to_string();
        let prefix = scratch.join("page");
        let args: [&OsStr; 5] = [
            OsStr::new("-r"),
            OsStr::new(&resolution),
            OsStr::new("-png"),
            pdf.as_os_str(),
            prefix.as_os_str(),
        ];
        run_tool(&self.pdftoppm, args).await?;

        let mut pages = Vec::new();
        let mut dir = tokio::fs::read_dir(scratch)
            .await
            .map_err(|e| StoreError::io(scratch, e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StoreError::io(scratch, e))?
        {
            let path = entry.path();
            if let Some(number) = page_number(&path) {
                pages.push((number, path));
            }
        }
        pages.sort();
        Ok(pages.into_iter().map(|(_, path)| path).collect())
    }
}

#[async_trait]
impl DocumentConverter for ExternalConverter {
    async fn convert(&self, path: &Path, dpi: u32) -> Result<Vec<DynamicImage>, ConversionError> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let kind = DocumentKind::from_filename(name)?;
        let scratch = tempfile::tempdir().map_err(|e| StoreError::io(&std::env::temp_dir(), e))?;

        let pdf = match kind {
            DocumentKind::Pdf => path.to_path_buf(),
            DocumentKind::Office => self.office_to_pdf(path, scratch.path()).await?,
        };
        let page_files = self.rasterize(&pdf, dpi, scratch.path()).await?;
        if page_files.is_empty() {
            return Err(ConversionError::NoPages);
        }
        debug!(pages = page_files.len(), dpi, "Rasterized document");

        let encoder = self.encoder.clone();
        let pages = tokio::task::spawn_blocking(move || {
            page_files
                .iter()
                .map(|file| {
                    let data = std::fs::read(file).map_err(|e| StoreError::io(file, e))?;
                    Ok(encoder.decode(&data)?)
                })
                .collect::<Result<Vec<_>, ConversionError>>()
        })
        .await
        .map_err(|e| EncodeError::Task(e.to_string()))??;

        info!(
            document = %path.display(),
            pages = pages.len(),
            dpi,
            "Converted document"
        );
        Ok(pages)
    }

    async fn check_available(&self) -> Vec<ToolStatus> {
        vec![
            probe(&self.pdftoppm, "-v").await,
            probe(&self.soffice, "--version").await,
        ]
    }
}

/// Run `tool` to completion, mapping launch and exit failures.
async fn run_tool<I, S>(tool: &Path, args: I) -> Result<(), ConversionError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(tool)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ConversionError::ConverterUnavailable {
            tool: tool.display().to_string(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(ConversionError::ConverterFailed {
            tool: tool.display().to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

async fn probe(tool: &Path, flag: &str) -> ToolStatus {
    match Command::new(tool).arg(flag).output().await {
        Ok(output) => {
            // pdftoppm prints its version on stderr.
            let text = if output.stdout.is_empty() {
                &output.stderr
            } else {
                &output.stdout
            };
            ToolStatus {
                tool: tool.display().to_string(),
                available: true,
                detail: String::from_utf8_lossy(text)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            }
        }
        Err(e) => ToolStatus {
            tool: tool.display().to_string(),
            available: false,
            detail: e.to_string(),
        },
    }
}

/// Page number of a `pdftoppm` output file such as `page-07.png`.
fn page_number(path: &Path) -> Option<u32> {
    if path.extension().and_then(|e| e.to_str()) != Some("png") {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("page-")?
        .parse()
        .ok()
}
