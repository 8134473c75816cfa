//! Long Image Streamer - renders documents into tall images and streams them.
//!
//! This binary starts the HTTP server and runs the cache maintenance commands.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use long_image_streamer::{
    cache::ArtifactStore,
    config::{CheckConfig, ClearConfig, Cli, Command, PruneConfig, ServeConfig},
    render::{DocumentConverter, ExternalConverter},
    server::{create_router, RouterConfig},
    service::ImageService,
    tile::ArtifactEncoder,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Serve(config) => run_serve(config).await,
        Command::Prune(config) => run_prune(config).await,
        Command::Clear(config) => run_clear(config).await,
        Command::Check(config) => run_check(config).await,
    }
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: ServeConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let service_config = match config.service_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    print_banner();

    info!("Configuration:");
    info!("  Cache dir: {}", config.cache_dir.display());
    info!(
        "  Tiles: {} rows, {} q{}",
        config.tile_height, service_config.tile_format, config.tile_quality
    );
    info!("  Levels: {}", service_config.levels);
    info!("  Viewport buffer: {} bands", config.viewport_buffer);
    info!(
        "  Memory cache: {} MB, {} decoded image(s)",
        config.memory_cache / (1024 * 1024),
        config.decoded_images
    );
    let policy = config.eviction_policy();
    if policy.is_unbounded() {
        warn!("  Eviction: DISABLED - derived artifacts grow without bound");
    } else {
        info!(
            "  Eviction: ttl={:?} max_bytes={:?}, at most every {}s after writes",
            policy.ttl, policy.max_bytes, config.prune_interval_secs
        );
    }
    info!("  Cache max-age: {}s", config.cache_max_age);
    if let Some(ref origins) = config.cors_origins {
        info!("  CORS origins: {:?}", origins);
    } else {
        info!("  CORS: allowing any origin");
    }

    let converter = ExternalConverter::new(&config.pdftoppm, &config.soffice)
        .with_encoder(ArtifactEncoder::with_decode_limit(config.max_decode_bytes));
    for status in converter.check_available().await {
        if status.available {
            info!("  {}: {}", status.tool, status.detail);
        } else {
            warn!(
                "  {}: unavailable ({}) - uploads needing it will fail",
                status.tool, status.detail
            );
        }
    }

    let service = match ImageService::open(service_config, Arc::new(converter)).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to open cache directory: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let router = create_router(service, build_router_config(&config));

    let addr = config.bind_address();
    info!("");
    info!("Server listening on http://{}", addr);
    info!("");
    info!("Endpoints:");
    info!("  Health:    GET  /health");
    info!("  Upload:    POST /documents?filename={{name}}&dpi={{dpi}}");
    info!("  Metadata:  GET  /images/{{key}}");
    info!("  Tile:      GET  /images/{{key}}/tiles/{{index}}");
    info!("  Viewport:  POST /images/{{key}}/viewport");
    info!("  Viewer:    GET  /view/{{key}}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = axum::serve(listener, router).await {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Print the startup banner.
fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("");
    info!("╻  ┏━┓┏┓╻┏━╸   ╻┏┳┓┏━┓┏━╸┏━╸");
    info!("┃  ┃ ┃┃┗┫┃╺┓   ┃┃┃┃┣━┫┃╺┓┣╸ ");
    info!("┗━╸┗━┛╹ ╹┗━┛   ╹╹ ╹╹ ╹┗━┛┗━╸");
    info!("  s t r e a m e r   v{}", version);
    info!("");
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "long_image_streamer=debug,tower_http=debug"
    } else {
        "long_image_streamer=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build RouterConfig from the application ServeConfig.
fn build_router_config(config: &ServeConfig) -> RouterConfig {
    let mut router_config = RouterConfig::new()
        .with_cache_max_age(config.cache_max_age)
        .with_max_upload_bytes(config.max_upload_bytes)
        .with_tracing(!config.no_tracing);

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    router_config
}

// =============================================================================
// Prune Command
// =============================================================================

async fn run_prune(config: PruneConfig) -> ExitCode {
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let store = match ArtifactStore::open(&config.cache_dir).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let report = match store.prune(&config.eviction.policy()).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if config.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("Pruned {}", config.cache_dir.display());
        println!("  Images:    {}", report.images);
        println!("  Scanned:   {} artifact(s)", report.scanned);
        println!("  Removed:   {} artifact(s)", report.removed);
        println!("  Freed:     {} bytes", report.freed_bytes);
        println!("  Retained:  {} bytes", report.retained_bytes);
        println!("  Sources:   {} bytes (never evicted)", report.exempt_bytes);
    }

    ExitCode::SUCCESS
}

// =============================================================================
// Clear Command
// =============================================================================

async fn run_clear(config: ClearConfig) -> ExitCode {
    let key = match config.cache_key() {
        Ok(k) => k,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let store = match ArtifactStore::open(&config.cache_dir).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match store.clear_image(&key).await {
        Ok(true) => {
            println!("Removed {}", key);
            ExitCode::SUCCESS
        }
        Ok(false) => {
            eprintln!("No artifacts stored for {}", key);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Check Command
// =============================================================================

async fn run_check(config: CheckConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    println!("Long Image Streamer Configuration Check");
    println!("═══════════════════════════════════════");
    println!();

    match config.level_set() {
        Ok(levels) => println!("✓ Levels: {}", levels),
        Err(e) => {
            println!("✗ Levels: {}", e);
            return ExitCode::FAILURE;
        }
    }

    match ArtifactStore::open(&config.cache_dir).await {
        Ok(store) => match store.list_images().await {
            Ok(images) => println!(
                "✓ Cache dir: {} ({} image(s))",
                config.cache_dir.display(),
                images.len()
            ),
            Err(e) => {
                println!("✗ Cache dir: {}", e);
                return ExitCode::FAILURE;
            }
        },
        Err(e) => {
            println!("✗ Cache dir: {}", e);
            return ExitCode::FAILURE;
        }
    }
    println!();

    let converter = ExternalConverter::new(&config.pdftoppm, &config.soffice);
    let mut missing = 0;
    for status in converter.check_available().await {
        if status.available {
            println!("✓ {}: {}", status.tool, status.detail);
        } else {
            missing += 1;
            println!("✗ {}: {}", status.tool, status.detail);
        }
    }

    println!();
    println!("═══════════════════════════════════════");
    if missing > 0 {
        println!("✗ {} converter(s) unavailable", missing);
        println!();
        println!("Please check:");
        println!("  - poppler-utils provides pdftoppm (PDF uploads)");
        println!("  - LibreOffice provides soffice (office uploads)");
        return ExitCode::FAILURE;
    }
    println!("✓ All checks passed!");

    ExitCode::SUCCESS
}
