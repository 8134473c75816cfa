use std::path::Path;

use thiserror::Error;

/// A cache key string that does not parse.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid cache key '{key}': {reason}")]
pub struct KeyError {
    pub key: String,
    pub reason: String,
}

impl KeyError {
    pub(crate) fn new(key: &str, reason: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the on-disk artifact store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Filesystem operation failed
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    /// A stored metadata file could not be decoded
    #[error("Corrupt metadata at {path}: {message}")]
    CorruptMetadata { path: String, message: String },

    /// A blocking store task was cancelled or panicked
    #[error("Store task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Failure to decode or encode a single bitmap.
///
/// These are local to one artifact: a pyramid level that fails is omitted,
/// a tile that fails is retried on its next access.
#[derive(Debug, Clone, Error)]
pub enum EncodeError {
    /// Stored bytes are not a decodable image
    #[error("Failed to decode image: {message}")]
    Decode { message: String },

    /// Encoder rejected the bitmap (size limits, color type)
    #[error("Failed to encode {format} image: {message}")]
    Encode { format: String, message: String },

    /// A blocking encode task was cancelled or panicked
    #[error("Encode task failed: {0}")]
    Task(String),
}

/// Invalid pyramid level definitions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LevelError {
    #[error("At least one pyramid level is required")]
    Empty,

    #[error("Invalid level definition '{0}': expected name:max_width:quality")]
    Malformed(String),

    #[error("Invalid level name '{0}': use lowercase letters, digits, '-' or '_'")]
    InvalidName(String),

    #[error("Duplicate level name '{0}'")]
    Duplicate(String),

    #[error("Level '{name}' has invalid quality {quality} (must be 1-100)")]
    InvalidQuality { name: String, quality: u32 },

    #[error("Level '{name}' has invalid max width {max_width} (must be > 0)")]
    InvalidWidth { name: String, max_width: u32 },

    #[error("Level '{name}' (max width {max_width}) is narrower than the level before it ({previous})")]
    NotMonotonic {
        name: String,
        max_width: u32,
        previous: u32,
    },
}

/// Errors from turning an uploaded document into a source image.
///
/// All of these are fatal to the upload request.
#[derive(Debug, Clone, Error)]
pub enum ConversionError {
    /// Extension is not a document type we can convert (HTTP 415)
    #[error("Unsupported document format: {extension}")]
    UnsupportedFormat { extension: String },

    /// An external tool is not installed or not executable (HTTP 503)
    #[error("Converter unavailable: {tool}: {message}")]
    ConverterUnavailable { tool: String, message: String },

    /// An external tool ran but failed (HTTP 422)
    #[error("Converter {tool} failed ({status}): {stderr}")]
    ConverterFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    /// Conversion produced no page bitmaps (HTTP 422)
    #[error("Document produced no pages")]
    NoPages,

    /// Page bitmaps could not be stacked into one image (HTTP 422)
    #[error("Failed to stitch pages: {0}")]
    Stitch(String),

    /// Request parameters out of range (HTTP 400)
    #[error("Invalid render parameters: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from serving artifacts of an already rendered image.
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// No source image exists for the key
    #[error("Image not found: {key}")]
    NotFound { key: String },

    #[error(transparent)]
    InvalidKey(#[from] KeyError),

    /// Tile index past the last tile
    #[error("Tile {index} not found: image has {count} tiles")]
    TileNotFound { index: u32, count: u32 },

    #[error("Invalid tile index '{0}'")]
    InvalidTileIndex(String),

    /// Level name not part of the configured level set
    #[error("Unknown pyramid level: {name}")]
    UnknownLevel { name: String },

    /// Neither the level nor any lower level could be produced
    #[error("No pyramid level available at or below '{name}'")]
    LevelUnavailable { name: String },

    #[error("Invalid tile height {height} (must be {min}-{max})")]
    InvalidTileHeight { height: u32, min: u32, max: u32 },

    #[error("Invalid quality {quality} (must be 1-100)")]
    InvalidQuality { quality: u32 },

    #[error("Invalid tile range {start}-{end} for {count} tiles")]
    InvalidRange { start: u32, end: u32, count: u32 },

    #[error("Tile range {start}-{end} spans more than {max} tiles")]
    RangeTooLarge { start: u32, end: u32, max: u32 },

    #[error("Invalid viewport: {0}")]
    InvalidViewport(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl ImageError {
    pub(crate) fn not_found(key: &impl std::fmt::Display) -> Self {
        ImageError::NotFound {
            key: key.to_string(),
        }
    }
}
