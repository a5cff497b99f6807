//! `imgcache` - maintenance tool for an image cache directory.
//!
//! Meant to be run by hand or from cron: inspecting the cache, pruning it
//! down to size and reaping failed or stalled writes.

use clap::{ArgAction, Parser, Subcommand};
use imgcache::{Config, ImageCache};
use miette::{Report, miette};
use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "imgcache")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "IMGCACHE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// List cached images with their statistics
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the total size of cached images in bytes
    Size,
    /// List queued images, oldest first
    Queued,
    /// Queue images for caching
    Queue {
        #[arg(required = true)]
        image_ids: Vec<String>,
    },
    /// Delete a cached image
    Delete {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        image_id: Option<String>,
        /// Delete every cached image
        #[arg(long)]
        all: bool,
    },
    /// Remove an image from the queue
    DeleteQueued {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        image_id: Option<String>,
        /// Empty the queue
        #[arg(long)]
        all: bool,
    },
    /// Evict least recently accessed images until the cache fits its size limit
    Prune {
        /// Size limit in bytes, instead of the configured one
        #[arg(long)]
        max_size: Option<u64>,
    },
    /// Reap all invalid files and stalled incomplete files
    Clean {
        /// Seconds after which an incomplete file counts as stalled
        #[arg(long, value_name = "SECONDS")]
        stall_time: Option<u64>,
    },
    /// Delete failed writes (all of them, unless a grace period is given)
    ReapInvalid {
        #[arg(long, value_name = "SECONDS")]
        grace: Option<u64>,
    },
    /// Delete incomplete writes older than the grace period (default: configured stall time)
    ReapStalled {
        #[arg(long, value_name = "SECONDS")]
        grace: Option<u64>,
    },
}

fn report(e: impl Debug) -> Report {
    miette!("{e:?}")
}

fn init_logging(verbose: u8) {
    // 0 = warn, 1 = info, 2+ = debug
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = ["imgcache", "imgcache_config", "imgcache_db", "imgcache_storage"]
        .map(|target| format!("{target}={level}"))
        .join(",");
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = Config::load(cli.config.as_deref()).map_err(report)?;
    let cache = ImageCache::open(&config).await.map_err(report)?;
    run(cli.command, &cache).await
}

async fn run(command: Commands, cache: &ImageCache) -> miette::Result<()> {
    match command {
        Commands::List { json } => {
            let images = cache.get_cached_images().await.map_err(report)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&images).map_err(report)?);
            } else {
                for image in images {
                    println!("{}\t{}\t{}\t{}", image.image_id, image.size, image.hits, image.last_accessed);
                }
            }
        },
        Commands::Size => {
            let size = cache.get_cache_size().await.map_err(report)?;
            println!("{size}");
        },
        Commands::Queued => {
            for image_id in cache.get_queued_images().await.map_err(report)? {
                println!("{image_id}");
            }
        },
        Commands::Queue { image_ids } => {
            for image_id in image_ids {
                let outcome = if cache.queue_image(&image_id).await.map_err(report)? { "queued" } else { "skipped" };
                println!("{outcome}\t{image_id}");
            }
        },
        Commands::Delete { all: true, .. } => {
            let deleted = cache.delete_all_cached_images().await.map_err(report)?;
            println!("deleted {deleted} cached images");
        },
        Commands::Delete { image_id: Some(image_id), .. } => {
            if !cache.delete_cached_image(&image_id).await.map_err(report)? {
                return Err(miette!("image {image_id} is not cached"));
            }
        },
        Commands::DeleteQueued { all: true, .. } => {
            let deleted = cache.delete_all_queued_images().await.map_err(report)?;
            println!("deleted {deleted} queued images");
        },
        Commands::DeleteQueued { image_id: Some(image_id), .. } => {
            if !cache.delete_queued_image(&image_id).await.map_err(report)? {
                return Err(miette!("image {image_id} is not queued"));
            }
        },
        Commands::Delete { image_id: None, .. } | Commands::DeleteQueued { image_id: None, .. } => {
            return Err(miette!("either an image id or --all is required"));
        },
        Commands::Prune { max_size } => {
            let (files, bytes) = cache.prune_to(max_size.unwrap_or(cache.max_size())).await.map_err(report)?;
            println!("pruned {files} images ({bytes} bytes)");
        },
        Commands::Clean { stall_time } => {
            let (invalid, stalled) = cache.clean(stall_time.map(Duration::from_secs)).await.map_err(report)?;
            println!("reaped {invalid} invalid and {stalled} stalled images");
        },
        Commands::ReapInvalid { grace } => {
            let reaped = cache.reap_invalid(grace.map(Duration::from_secs)).await.map_err(report)?;
            println!("reaped {reaped} invalid images");
        },
        Commands::ReapStalled { grace } => {
            let reaped = cache.reap_stalled(grace.map(Duration::from_secs)).await.map_err(report)?;
            println!("reaped {reaped} stalled images");
        },
    }
    Ok(())
}
