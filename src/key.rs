//! Cache keys.
//!
//! Every artifact the system produces lives under a directory named by a
//! [`CacheKey`]: the SHA-256 of the uploaded document's bytes plus the render
//! parameters that shaped the stitched image.
//!
//! ```text
//! 3f2a…c9e1-300dpi-jpg-q85/
//! └─────┬──────┘ └─┬──┘ └┬┘ └┬┘
//!   sha256 hex    dpi   fmt quality
//! ```
//!
//! The same document with the same parameters always maps to the same key,
//! and any parameter change maps to a different one. Parsing is strict so a
//! key taken from a URL can never name a path outside the cache root.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::KeyError;

/// Lowest accepted rasterization resolution.
pub const MIN_DPI: u32 = 72;

/// Highest accepted rasterization resolution.
pub const MAX_DPI: u32 = 600;

/// Resolution used when the caller does not ask for one.
pub const DEFAULT_DPI: u32 = 300;

// =============================================================================
// Output Format
// =============================================================================

/// Encoded image format of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    /// File extension used on disk and in URLs.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Jpeg => f.write_str("jpeg"),
            OutputFormat::Png => f.write_str("png"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            other => Err(format!("unknown image format '{}' (use jpeg or png)", other)),
        }
    }
}

// =============================================================================
// Content Hash
// =============================================================================

/// SHA-256 digest of a document's raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse 64 lowercase hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return None;
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Self(out))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

// =============================================================================
// Cache Key
// =============================================================================

/// Identity of one rendered image: document content plus render parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    content: ContentHash,
    dpi: u32,
    format: OutputFormat,
    quality: u8,
}

impl CacheKey {
    pub fn new(content: ContentHash, dpi: u32, format: OutputFormat, quality: u8) -> Self {
        Self {
            content,
            dpi,
            format,
            quality,
        }
    }

    /// Hash `document` and combine it with the render parameters.
    pub fn for_document(document: &[u8], dpi: u32, format: OutputFormat, quality: u8) -> Self {
        Self::new(ContentHash::of(document), dpi, format, quality)
    }

    pub fn content(&self) -> &ContentHash {
        &self.content
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    /// Format requested at render time. The stored source may differ if
    /// encoding had to fall back.
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}dpi-{}-q{}",
            self.content.to_hex(),
            self.dpi,
            self.format.extension(),
            self.quality
        )
    }
}

impl FromStr for CacheKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let (Some(hash), Some(dpi), Some(format), Some(quality), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(KeyError::new(s, "expected <hash>-<dpi>dpi-<format>-q<quality>"));
        };

        let content = ContentHash::from_hex(hash)
            .ok_or_else(|| KeyError::new(s, "hash must be 64 lowercase hex characters"))?;

        let dpi = dpi
            .strip_suffix("dpi")
            .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|d| d.parse::<u32>().ok())
            .ok_or_else(|| KeyError::new(s, "dpi segment must look like 300dpi"))?;

        let format = match format {
            "jpg" => OutputFormat::Jpeg,
            "png" => OutputFormat::Png,
            _ => return Err(KeyError::new(s, "format segment must be jpg or png")),
        };

        let quality = quality
            .strip_prefix('q')
            .filter(|q| !q.is_empty() && q.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|q| q.parse::<u8>().ok())
            .ok_or_else(|| KeyError::new(s, "quality segment must look like q85"))?;

        let key = CacheKey::new(content, dpi, format, quality);
        // Reject non-canonical spellings such as leading zeros.
        if key.to_string() != s {
            return Err(KeyError::new(s, "key is not in canonical form"));
        }
        Ok(key)
    }
}

// =============================================================================
// Tests
// =============================================================================
