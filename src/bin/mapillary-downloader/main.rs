mod args;
mod validators;

use anyhow::{Context, Result};
use args::{Args, Command};
use mapillary_downloader::{compact, fetch, Config, Outcome, ZOOM};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn init_tracing(quiet: bool, verbose: bool) {
    let level = if quiet {
        LevelFilter::WARN
    } else if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse()?;
    init_tracing(args.quiet, args.verbose);

    let (options, dry_run) = match args.command {
        Command::TilesDb { dir, output } => {
            let entries = compact(&dir, &output).with_context(|| {
                format!("failed compacting tiles in {}", dir.display())
            })?;
            eprintln!("wrote {} images to {}", entries, output.display());
            return Ok(());
        }
        Command::Download { options, dry_run } => (options, dry_run),
    };

    if dry_run {
        let tile_count = options.bounding_box()?.tiles().len();
        eprintln!("would process {} tiles at zoom {}", tile_count, ZOOM);
        return Ok(());
    }

    let config = Config::resolve(options).context("invalid configuration")?;

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, finishing up");
            ctrl_c_cancel.cancel();
        }
    });

    let report = fetch(config, &cancel, !args.quiet).await?;
    let stats = report.stats;
    info!(
        tiles = stats.tiles_processed,
        tiles_skipped = stats.tiles_skipped,
        tiles_failed = stats.tiles_failed,
        downloaded = stats.images_downloaded,
        already_present = stats.images_present,
        failed = stats.images_failed,
        "done",
    );

    match report.outcome {
        Outcome::Completed => {}
        Outcome::InsufficientSpace => info!("stopped early to keep disk space free, rerun to resume"),
        Outcome::Cancelled => info!("cancelled, rerun to resume"),
    }

    Ok(())
}
