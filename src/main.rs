//! CLI entry point.
//!
//! Grounded on the teacher's `fetch_gibs_tiles.rs::main`
//! (`#[tokio::main(flavor = "multi_thread")]`, `indicatif` progress bars)
//! generalized from a hardcoded GIBS fetch to an arbitrary config-driven
//! task, with `clap` for argument parsing (`other_examples/…
//! NeoLegends-osm-tile-downloader…main.rs` is the closest on-domain CLI
//! reference in the retrieval pack).

use std::path::PathBuf;

use clap::Parser;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use tracing_subscriber::EnvFilter;

use tile_fetcher::config::Settings;
use tile_fetcher::{Coordinator, Event};

/// Fetch every tile matching a tile-source configuration into an MBTiles
/// archive or a tile directory.
#[derive(Parser, Debug)]
#[command(name = "tile-fetcher", version, about)]
struct Cli {
    /// Path to the task's TOML configuration file.
    config: PathBuf,

    /// Compute and print the planned layer counts without fetching anything.
    #[arg(long)]
    dry_run: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity, suppressing info-level output.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let settings = Settings::load(&cli.config).await?;

    if cli.dry_run {
        run_dry(&settings).await?;
        return Ok(());
    }

    let (coordinator, mut events) = Coordinator::new(settings).await?;

    let multi = MultiProgress::new();
    let mut bars: HashMap<u32, ProgressBar> = HashMap::new();
    let style = ProgressStyle::with_template("{prefix} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) ETA {eta}")
        .unwrap()
        .progress_chars("##-");

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::LayerProgressUpdated { zoom, current, total } => {
                    let bar = bars.entry(zoom).or_insert_with(|| {
                        let bar = multi.add(ProgressBar::new(total as u64));
                        bar.set_style(style.clone());
                        bar.set_prefix(format!("z={zoom}"));
                        bar
                    });
                    bar.set_length(total.max(0) as u64);
                    bar.set_position(current.max(0) as u64);
                }
                Event::LayerCompleted { zoom, count } => {
                    if let Some(bar) = bars.get(&zoom) {
                        bar.finish_with_message(format!("z={zoom} done ({count} tiles)"));
                    }
                }
                Event::ErrorOccurred { message } => {
                    tracing::warn!("{message}");
                }
                Event::StatusChanged { text } => {
                    tracing::info!("{text}");
                }
                Event::TaskCompleted => {
                    tracing::info!("task completed");
                }
                Event::TileDownloaded { z, x, y, bytes, millis } => {
                    tracing::debug!(z, x, y, bytes, millis, "tile downloaded");
                }
                Event::ProgressUpdated { current, total } => {
                    tracing::trace!(current, total, "progress");
                }
            }
        }
    });

    let result = coordinator.run().await;
    // Drop the coordinator (and with it its `events_tx`) before draining the
    // event task: `events.recv()` only returns `None` once every sender is
    // gone, and the coordinator holds the last one after `run` returns.
    drop(coordinator);
    event_task.await.ok();

    result?;
    Ok(())
}

async fn run_dry(settings: &Settings) -> anyhow::Result<()> {
    let total = tile_fetcher::coordinator::estimate_total(settings).await;
    println!("planned total tiles (estimate): {total}");
    Ok(())
}
