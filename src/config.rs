//! Configuration management for the long image streamer.
//!
//! Settings come from command-line arguments (clap) with `LIS_`-prefixed
//! environment variable fallbacks and defaults for everything optional.
//!
//! # Subcommands
//!
//! - `serve` - run the HTTP API
//! - `prune` - apply the eviction policy to a cache directory once
//! - `clear <key>` - remove every artifact of one image
//! - `check` - validate settings and probe the external converters
//!
//! # Environment Variables
//!
//! - `LIS_HOST` - Server bind address (default: 0.0.0.0)
//! - `LIS_PORT` - Server port (default: 3000)
//! - `LIS_CACHE_DIR` - Artifact cache root (default: cache)
//! - `LIS_TILE_HEIGHT` - Rows per tile band (default: 1000)
//! - `LIS_TILE_QUALITY` - Tile JPEG quality (default: 90)
//! - `LIS_TILE_FORMAT` - Tile format, jpeg or png (default: jpeg)
//! - `LIS_LEVELS` - Pyramid levels as `name:max_width:quality,...`
//! - `LIS_VIEWPORT_BUFFER` - Bands prefetched around the viewport (default: 2)
//! - `LIS_MEMORY_CACHE` - In-memory artifact cache in bytes (default: 64 MiB)
//! - `LIS_DECODED_IMAGES` - Decoded source bitmaps kept in memory (default: 2)
//! - `LIS_MAX_DECODE_BYTES` - Largest source bitmap to decode (default: 2 GiB)
//! - `LIS_CACHE_MAX_BYTES` - Byte cap on derived artifacts (default: unbounded)
//! - `LIS_CACHE_TTL_SECS` - Evict derived artifacts idle this long (default: never)
//! - `LIS_PRUNE_INTERVAL_SECS` - Minimum seconds between prunes after new artifacts (default: 300)
//! - `LIS_CACHE_MAX_AGE` - HTTP cache max-age seconds (default: 3600)
//! - `LIS_CORS_ORIGINS` - Comma-separated allowed origins (default: any)
//! - `LIS_PDFTOPPM` / `LIS_SOFFICE` - Converter executables

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::cache::{EvictionPolicy, DEFAULT_MEMORY_CACHE_BYTES};
use crate::key::{CacheKey, OutputFormat};
use crate::server::DEFAULT_MAX_UPLOAD_BYTES;
use crate::service::ServiceConfig;
use crate::source::DEFAULT_DECODED_IMAGES;
use crate::tile::{
    is_valid_quality, LevelSet, DEFAULT_MAX_DECODE_BYTES, DEFAULT_TILE_HEIGHT,
    DEFAULT_TILE_QUALITY, MAX_TILE_HEIGHT, MIN_TILE_HEIGHT,
};
use crate::viewport::DEFAULT_VIEWPORT_BUFFER;

// =============================================================================
// Default Values
// =============================================================================

/// Default server host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default artifact cache root.
pub const DEFAULT_CACHE_DIR: &str = "cache";

/// Default HTTP cache max-age in seconds (1 hour).
pub const DEFAULT_CACHE_MAX_AGE: u32 = 3600;

/// Default seconds between background prune passes.
pub const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 300;

/// Default PDF rasterizer executable.
pub const DEFAULT_PDFTOPPM: &str = "pdftoppm";

/// Default office-to-PDF converter executable.
pub const DEFAULT_SOFFICE: &str = "soffice";

// =============================================================================
// CLI Arguments
// =============================================================================

/// Long Image Streamer - renders documents into one tall image and streams
/// it to viewers as bands and pyramid levels.
#[derive(Parser, Debug)]
#[command(name = "long-image-streamer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server.
    Serve(ServeConfig),

    /// Apply the eviction policy to a cache directory once.
    Prune(PruneConfig),

    /// Remove every artifact of one image.
    Clear(ClearConfig),

    /// Validate configuration and probe the external converters.
    Check(CheckConfig),
}

/// Eviction bounds shared by `serve` and `prune`.
#[derive(Args, Debug, Clone, Default)]
pub struct EvictionArgs {
    /// Keep derived artifacts (levels and tiles) under this many bytes
    #[arg(long, env = "LIS_CACHE_MAX_BYTES")]
    pub cache_max_bytes: Option<u64>,

    /// Evict derived artifacts not accessed for this many seconds
    #[arg(long, env = "LIS_CACHE_TTL_SECS")]
    pub cache_ttl_secs: Option<u64>,
}

impl EvictionArgs {
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_max_bytes == Some(0) {
            return Err("cache_max_bytes must be greater than 0".to_string());
        }
        if self.cache_ttl_secs == Some(0) {
            return Err("cache_ttl_secs must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn policy(&self) -> EvictionPolicy {
        let mut policy = EvictionPolicy::unbounded();
        if let Some(secs) = self.cache_ttl_secs {
            policy = policy.with_ttl(Duration::from_secs(secs));
        }
        if let Some(bytes) = self.cache_max_bytes {
            policy = policy.with_max_bytes(bytes);
        }
        policy
    }
}

/// Settings for `serve`.
#[derive(Args, Debug, Clone)]
pub struct ServeConfig {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind to
    #[arg(long, default_value = DEFAULT_HOST, env = "LIS_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "LIS_PORT")]
    pub port: u16,

    /// Largest accepted document upload in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES, env = "LIS_MAX_UPLOAD_BYTES")]
    pub max_upload_bytes: usize,

    // =========================================================================
    // Artifact Configuration
    // =========================================================================
    /// Directory holding sources, levels and tiles
    #[arg(long, default_value = DEFAULT_CACHE_DIR, env = "LIS_CACHE_DIR")]
    pub cache_dir: PathBuf,

    /// Rows per tile band
    #[arg(long, default_value_t = DEFAULT_TILE_HEIGHT, env = "LIS_TILE_HEIGHT")]
    pub tile_height: u32,

    /// Tile JPEG quality (1-100)
    #[arg(long, default_value_t = DEFAULT_TILE_QUALITY, env = "LIS_TILE_QUALITY")]
    pub tile_quality: u8,

    /// Tile format (jpeg or png)
    #[arg(long, default_value = "jpeg", env = "LIS_TILE_FORMAT")]
    pub tile_format: String,

    /// Pyramid levels as `name:max_width:quality,...`, lowest first
    #[arg(long, env = "LIS_LEVELS")]
    pub levels: Option<String>,

    /// Bands prefetched above and below the viewport
    #[arg(long, default_value_t = DEFAULT_VIEWPORT_BUFFER, env = "LIS_VIEWPORT_BUFFER")]
    pub viewport_buffer: u32,

    // =========================================================================
    // Memory Configuration
    // =========================================================================
    /// In-memory artifact cache size in bytes
    #[arg(long, default_value_t = DEFAULT_MEMORY_CACHE_BYTES, env = "LIS_MEMORY_CACHE")]
    pub memory_cache: usize,

    /// Decoded source bitmaps kept in memory
    #[arg(long, default_value_t = DEFAULT_DECODED_IMAGES, env = "LIS_DECODED_IMAGES")]
    pub decoded_images: usize,

    /// Largest source bitmap, in bytes, the server will decode
    #[arg(long, default_value_t = DEFAULT_MAX_DECODE_BYTES, env = "LIS_MAX_DECODE_BYTES")]
    pub max_decode_bytes: u64,

    // =========================================================================
    // Eviction Configuration
    // =========================================================================
    #[command(flatten)]
    pub eviction: EvictionArgs,

    /// Minimum seconds between prune passes triggered by new artifacts
    #[arg(long, default_value_t = DEFAULT_PRUNE_INTERVAL_SECS, env = "LIS_PRUNE_INTERVAL_SECS")]
    pub prune_interval_secs: u64,

    // =========================================================================
    // HTTP Configuration
    // =========================================================================
    /// HTTP Cache-Control max-age in seconds
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "LIS_CACHE_MAX_AGE")]
    pub cache_max_age: u32,

    /// Allowed CORS origins (comma-separated, empty = any origin)
    #[arg(long, env = "LIS_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Converters
    // =========================================================================
    /// PDF rasterizer executable
    #[arg(long, default_value = DEFAULT_PDFTOPPM, env = "LIS_PDFTOPPM")]
    pub pdftoppm: String,

    /// Office-to-PDF converter executable
    #[arg(long, default_value = DEFAULT_SOFFICE, env = "LIS_SOFFICE")]
    pub soffice: String,

    // =========================================================================
    // Logging
    // =========================================================================
    /// Enable verbose logging
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl ServeConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err("cache_dir must not be empty".to_string());
        }

        if !(MIN_TILE_HEIGHT..=MAX_TILE_HEIGHT).contains(&self.tile_height) {
            return Err(format!(
                "tile_height must be between {} and {}",
                MIN_TILE_HEIGHT, MAX_TILE_HEIGHT
            ));
        }

        if !is_valid_quality(u32::from(self.tile_quality)) {
            return Err("tile_quality must be between 1 and 100".to_string());
        }

        self.tile_format()?;
        self.level_set()?;

        if self.decoded_images == 0 {
            return Err("decoded_images must be greater than 0".to_string());
        }
        if self.max_decode_bytes == 0 {
            return Err("max_decode_bytes must be greater than 0".to_string());
        }
        if self.max_upload_bytes == 0 {
            return Err("max_upload_bytes must be greater than 0".to_string());
        }
        if self.prune_interval_secs == 0 {
            return Err("prune_interval_secs must be greater than 0".to_string());
        }

        if self.pdftoppm.trim().is_empty() || self.soffice.trim().is_empty() {
            return Err("converter executables must not be empty".to_string());
        }

        self.eviction.validate()
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tile_format(&self) -> Result<OutputFormat, String> {
        self.tile_format.parse()
    }

    /// Configured pyramid levels, or the built-in set.
    pub fn level_set(&self) -> Result<LevelSet, String> {
        match &self.levels {
            Some(spec) => LevelSet::parse(spec).map_err(|e| format!("levels: {}", e)),
            None => Ok(LevelSet::default()),
        }
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction.policy()
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    /// Build the service settings (call validate() first).
    pub fn service_config(&self) -> Result<ServiceConfig, String> {
        Ok(ServiceConfig {
            cache_dir: self.cache_dir.clone(),
            tile_height: self.tile_height,
            tile_quality: self.tile_quality,
            tile_format: self.tile_format()?,
            levels: self.level_set()?,
            viewport_buffer: self.viewport_buffer,
            memory_cache_bytes: self.memory_cache,
            decoded_images: self.decoded_images,
            max_decode_bytes: self.max_decode_bytes,
            eviction: self.eviction_policy(),
            prune_interval: self.prune_interval(),
        })
    }
}

/// Settings for `prune`.
#[derive(Args, Debug, Clone)]
pub struct PruneConfig {
    /// Directory holding sources, levels and tiles
    #[arg(long, default_value = DEFAULT_CACHE_DIR, env = "LIS_CACHE_DIR")]
    pub cache_dir: PathBuf,

    #[command(flatten)]
    pub eviction: EvictionArgs,

    /// Print the report as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

impl PruneConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.eviction.validate()?;
        if self.eviction.policy().is_unbounded() {
            return Err(
                "Nothing to prune. Set --cache-max-bytes and/or --cache-ttl-secs".to_string(),
            );
        }
        Ok(())
    }
}

/// Settings for `clear`.
#[derive(Args, Debug, Clone)]
pub struct ClearConfig {
    /// Image key, as returned by the upload endpoint
    pub key: String,

    /// Directory holding sources, levels and tiles
    #[arg(long, default_value = DEFAULT_CACHE_DIR, env = "LIS_CACHE_DIR")]
    pub cache_dir: PathBuf,
}

impl ClearConfig {
    pub fn cache_key(&self) -> Result<CacheKey, String> {
        self.key.parse().map_err(|e| format!("{}", e))
    }
}

/// Settings for `check`.
#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    /// Directory holding sources, levels and tiles
    #[arg(long, default_value = DEFAULT_CACHE_DIR, env = "LIS_CACHE_DIR")]
    pub cache_dir: PathBuf,

    /// Pyramid levels as `name:max_width:quality,...`, lowest first
    #[arg(long, env = "LIS_LEVELS")]
    pub levels: Option<String>,

    /// PDF rasterizer executable
    #[arg(long, default_value = DEFAULT_PDFTOPPM, env = "LIS_PDFTOPPM")]
    pub pdftoppm: String,

    /// Office-to-PDF converter executable
    #[arg(long, default_value = DEFAULT_SOFFICE, env = "LIS_SOFFICE")]
    pub soffice: String,

    /// Enable verbose logging
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl CheckConfig {
    pub fn level_set(&self) -> Result<LevelSet, String> {
        match &self.levels {
            Some(spec) => LevelSet::parse(spec).map_err(|e| format!("levels: {}", e)),
            None => Ok(LevelSet::default()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServeConfig {
        ServeConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_upload_bytes: 1024 * 1024,
            cache_dir: PathBuf::from("/tmp/lis"),
            tile_height: 500,
            tile_quality: 85,
            tile_format: "jpeg".to_string(),
            levels: None,
            viewport_buffer: 2,
            memory_cache: 1024 * 1024,
            decoded_images: 2,
            max_decode_bytes: 1 << 30,
            eviction: EvictionArgs::default(),
            prune_interval_secs: 60,
            cache_max_age: 7200,
            cors_origins: None,
            pdftoppm: "pdftoppm".to_string(),
            soffice: "soffice".to_string(),
            verbose: false,
            no_tracing: false,
        }
    }

    #[test]
    fn test_valid_config() {
        let config = test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_tile_height() {
        let mut config = test_config();
        config.tile_height = 1;
        assert!(config.validate().unwrap_err().contains("tile_height"));
    }

    #[test]
    fn test_invalid_tile_quality() {
        let mut config = test_config();
        config.tile_quality = 0;
        assert!(config.validate().is_err());

        config.tile_quality = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_tile_format() {
        let mut config = test_config();
        config.tile_format = "webp".to_string();
        assert!(config.validate().is_err());

        config.tile_format = "png".to_string();
        assert_eq!(config.tile_format().unwrap(), OutputFormat::Png);
    }

    #[test]
    fn test_levels_parsed_before_start() {
        let mut config = test_config();
        config.levels = Some("low:400:50,high:1600:85".to_string());
        let levels = config.level_set().unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels.lowest().name, "low");

        config.levels = Some("high:1600:85,low:400:50".to_string());
        assert!(config.validate().unwrap_err().starts_with("levels"));

        config.levels = Some("broken".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_levels() {
        let config = test_config();
        assert_eq!(config.level_set().unwrap(), LevelSet::default());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut config = test_config();
        config.decoded_images = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.max_decode_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.eviction.cache_max_bytes = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_address() {
        let config = test_config();
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_eviction_policy() {
        let mut config = test_config();
        assert!(config.eviction_policy().is_unbounded());

        config.eviction.cache_ttl_secs = Some(60);
        config.eviction.cache_max_bytes = Some(4096);
        let policy = config.eviction_policy();
        assert_eq!(policy.ttl, Some(Duration::from_secs(60)));
        assert_eq!(policy.max_bytes, Some(4096));
    }

    #[test]
    fn test_service_config() {
        let config = test_config();
        let service = config.service_config().unwrap();
        assert_eq!(service.cache_dir, PathBuf::from("/tmp/lis"));
        assert_eq!(service.tile_height, 500);
        assert_eq!(service.tile_quality, 85);
        assert_eq!(service.tile_format, OutputFormat::Jpeg);
        assert!(service.eviction.is_unbounded());
        assert_eq!(service.prune_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_prune_requires_bound() {
        let mut config = PruneConfig {
            cache_dir: PathBuf::from("/tmp/lis"),
            eviction: EvictionArgs::default(),
            json: false,
        };
        assert!(config.validate().is_err());

        config.eviction.cache_ttl_secs = Some(3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_clear_key() {
        let config = ClearConfig {
            key: "not a key".to_string(),
            cache_dir: PathBuf::from("/tmp/lis"),
        };
        assert!(config.cache_key().is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "long-image-streamer",
            "serve",
            "--port",
            "9000",
            "--cors-origins",
            "https://a.example,https://b.example",
        ])
        .unwrap();
        match cli.into_command() {
            Command::Serve(config) => {
                assert_eq!(config.port, 9000);
                assert_eq!(config.cors_origins.unwrap().len(), 2);
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::try_parse_from(["long-image-streamer", "clear", "abc"]).unwrap();
        assert!(matches!(cli.into_command(), Command::Clear(c) if c.key == "abc"));
    }
}
