//! Raster Tile Cache maintenance tool
//!
//! Inspects, verifies and purges cache directories written by the library.
//!
//! ```text
//! raster-tile-cache --cache-root /var/cache/tiles --instance ortho inspect
//! raster-tile-cache --config cache.yaml verify
//! raster-tile-cache --config cache.yaml purge
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use raster_tile_cache::{CacheConfig, CacheRegistry, Residency, TileCache};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Raster Tile Cache - inspect and maintain on-disk tile caches
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache configuration file (YAML, or JSON with a .json extension)
    #[arg(long, env = "RASTER_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Parent directory of the cache instances
    #[arg(long, env = "RASTER_CACHE_ROOT")]
    cache_root: Option<PathBuf>,

    /// Instance directory name under the root
    #[arg(long, env = "RASTER_CACHE_INSTANCE")]
    instance: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show usage and the least recently used disk tiles
    Inspect {
        /// Number of disk tiles to list
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Print the statistics snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rescan the directory, deleting stale, corrupt and orphaned files
    Verify,
    /// Delete every cached tile and the instance directory
    Purge,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(&args)?;
    info!(
        dir = %config.cache_dir().display(),
        version = raster_tile_cache::VERSION,
        "Opening tile cache"
    );

    let registry = CacheRegistry::new();
    let cache = registry
        .get_instance(&config)
        .with_context(|| format!("cannot open cache at {}", config.cache_dir().display()))?;

    match args.command {
        Command::Inspect { limit, json } => {
            let stats = cache.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }

            println!("directory:   {}", cache.dir().display());
            println!("disk tiles:  {}", stats.disk_entries);
            println!("disk bytes:  {}", stats.disk_bytes);
            println!("budgets:     memory {} / disk {}", cache.budgets().memory_bytes, cache.budgets().disk_bytes);
            for residency in [Residency::InMemory, Residency::OnDisk] {
                if let Some(tier) = stats.tier(residency) {
                    println!(
                        "{:<7}      hits {} / misses {} / evictions {} / discards {}",
                        residency.to_string(),
                        tier.hits,
                        tier.misses,
                        tier.evictions,
                        tier.stale_discards + tier.corrupt_discards
                    );
                }
            }
            println!();
            println!("{:>12}  key (oldest first)", "bytes");
            for (key, cost) in cache.disk_entries().into_iter().take(limit) {
                println!("{:>12}  {}", cost, key);
            }
        }
        Command::Verify => {
            let report = cache.rehydrate().context("directory scan failed")?;
            println!("adopted:   {} tiles, {} bytes", report.adopted, report.adopted_bytes);
            println!("stale:     {}", report.stale);
            println!("corrupt:   {}", report.corrupt);
            println!("orphaned:  {}", report.orphaned);
            println!("evicted:   {}", report.evicted);
            if report.discarded() > 0 {
                warn!(discarded = report.discarded(), "Removed unusable cache files");
            }
        }
        Command::Purge => {
            let bytes = cache.used_disk();
            cache.clear(true).context("purge failed")?;
            println!("removed {} bytes from {}", bytes, cache.dir().display());
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("cannot load {}", path.display()))?,
        None => CacheConfig::default(),
    };

    if let Some(root) = &args.cache_root {
        config.cache_root = Some(root.clone());
    }
    if let Some(instance) = &args.instance {
        config.instance_id = Some(instance.clone());
    }
    Ok(config)
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
