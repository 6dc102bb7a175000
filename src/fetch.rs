use futures::{prelude::*, stream};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{TileCache, COVERAGE};
use crate::config::Config;
use crate::disk::DiskSpaceGuard;
use crate::download::{DownloadFailurePolicy, ImageDownloader};
use crate::error::{Error, Result};
use crate::feature::{Feature, FeatureFilter};
use crate::http::{HttpClient, ReqwestClient};
use crate::ledger::FailureRecorder;
use crate::resolver::ImageResolver;
use crate::store::SequenceStore;
use crate::url::UrlFormat;

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every tile in the bounding box was processed.
    Completed,
    /// Free disk space dropped below the floor. Rerun once space is freed.
    InsufficientSpace,
    /// The run was interrupted.
    Cancelled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub tiles_processed: usize,
    /// Tiles not on the tile allow-list.
    pub tiles_skipped: usize,
    pub tiles_failed: usize,
    pub images_downloaded: usize,
    pub images_present: usize,
    pub images_failed: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: Outcome,
    pub stats: RunStats,
}

enum FeatureOutcome {
    Downloaded,
    Present,
    Failed,
}

/// The download pipeline: tiles of the bounding box, their cached features,
/// and for every feature not yet on disk the resolve, download and commit
/// steps.
pub struct Pipeline<C> {
    config: Config,
    cache: TileCache<C>,
    filter: FeatureFilter,
    store: SequenceStore,
    resolver: ImageResolver<C>,
    downloader: ImageDownloader<C>,
    guard: DiskSpaceGuard,
    recorder: FailureRecorder,
    progress: bool,
}

impl<C: HttpClient> Pipeline<C> {
    pub fn new(config: Config, client: Arc<C>) -> Self {
        Self {
            cache: TileCache::new(&config.tile_cache_dir, client.clone(), &config.access_token),
            filter: FeatureFilter::new(config.bounding_box, config.allowed_image_ids.clone()),
            store: SequenceStore::new(&config.seq_dir),
            resolver: ImageResolver::new(client.clone(), &config.access_token, config.retry),
            downloader: ImageDownloader::new(client, config.retry),
            guard: DiskSpaceGuard::new(config.required_free_space),
            recorder: FailureRecorder::new(config.failed_image_id_file.clone()),
            progress: true,
            config,
        }
    }

    pub fn with_tile_url(mut self, url: UrlFormat) -> Self {
        self.cache = self.cache.with_url(url);
        self
    }

    pub fn with_image_url(mut self, url: UrlFormat) -> Self {
        self.resolver = self.resolver.with_url(url);
        self
    }

    /// Replaces the guard measuring free space with the OS.
    pub fn with_disk_guard(mut self, guard: DiskSpaceGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn show_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Processes all tiles in order.
    ///
    /// Tile failures skip the tile and resolve failures skip the image. A
    /// download failure ends the run with an error under
    /// [`DownloadFailurePolicy::Abort`]. Running out of disk space and
    /// cancellation end the run early, but not as errors.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        fs::create_dir_all(&self.config.tile_cache_dir).await?;
        if !self.config.tiles_only {
            fs::create_dir_all(&self.config.seq_dir).await?;
        }

        let tiles = self.config.tiles();
        info!(
            tiles = tiles.len(),
            free_space_floor = %pretty_bytes::converter::convert(self.guard.required() as f64),
            failure_file = ?self.recorder.path(),
            "processing tiles",
        );

        let pb = if self.progress {
            ProgressBar::new(tiles.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:60.cyan/blue} {pos:>7}/{len:7} ETA: {eta} {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }

        let mut stats = RunStats::default();
        let mut outcome = Outcome::Completed;

        for tile in pb.wrap_iter(tiles.into_iter()) {
            if cancel.is_cancelled() {
                outcome = Outcome::Cancelled;
                break;
            }

            if let Some(allowed) = &self.config.allowed_tiles {
                if !allowed.contains(&tile.cache_key(COVERAGE)) {
                    debug!(tile = %tile, "tile not on allow-list");
                    stats.tiles_skipped += 1;
                    continue;
                }
            }

            pb.set_message(tile.to_string());
            let collection = match self.cache.fetch(tile, self.config.overwrite).await {
                Ok(collection) => collection,
                Err(e @ (Error::TileFetch { .. } | Error::MalformedTileData(_))) => {
                    warn!(tile = %tile, error = %e, "skipping tile");
                    stats.tiles_failed += 1;
                    continue;
                }
                Err(e) => {
                    pb.finish_and_clear();
                    return Err(e);
                }
            };
            stats.tiles_processed += 1;

            if self.config.tiles_only {
                continue;
            }

            let features = self.filter.apply(&collection);
            debug!(
                tile = %tile,
                total = collection.features.len(),
                accepted = features.len(),
                "filtered features",
            );

            match self.process_tile(features, cancel, &mut stats).await {
                Ok(()) => {}
                Err(Error::InsufficientSpace { .. }) => {
                    info!("stopping: not enough free disk space left");
                    outcome = Outcome::InsufficientSpace;
                    break;
                }
                Err(Error::Cancelled) => {
                    outcome = Outcome::Cancelled;
                    break;
                }
                Err(e) => {
                    pb.finish_and_clear();
                    return Err(e);
                }
            }
        }

        pb.finish_and_clear();

        if outcome == Outcome::Cancelled {
            info!("run cancelled, no partial files were committed");
        }

        Ok(RunReport { outcome, stats })
    }

    async fn process_tile(
        &self,
        features: Vec<Feature>,
        cancel: &CancellationToken,
        stats: &mut RunStats,
    ) -> Result<()> {
        let mut results = stream::iter(features)
            .map(|feature| self.process_feature(feature, cancel))
            .buffer_unordered(self.config.parallel_downloads.max(1));

        // Returning early drops the in-flight features. Commits are atomic, so
        // nothing half-written is left behind.
        while let Some(res) = results.next().await {
            match res? {
                FeatureOutcome::Downloaded => stats.images_downloaded += 1,
                FeatureOutcome::Present => stats.images_present += 1,
                FeatureOutcome::Failed => stats.images_failed += 1,
            }
        }

        Ok(())
    }

    async fn process_feature(
        &self,
        feature: Feature,
        cancel: &CancellationToken,
    ) -> Result<FeatureOutcome> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if !self.config.overwrite && self.store.exists(&feature).await {
            debug!(image_id = feature.image_id, "image already downloaded");
            return Ok(FeatureOutcome::Present);
        }

        self.guard.check(self.store.root())?;

        let url = match self.resolver.resolve(feature.image_id, cancel).await {
            Ok(url) => url,
            Err(e @ Error::ResolveExhausted { .. }) => {
                warn!(error = %e, "skipping image");
                self.record_failure(feature.image_id).await;
                return Ok(FeatureOutcome::Failed);
            }
            Err(e) => return Err(e),
        };

        let data = match self.downloader.download(feature.image_id, &url, cancel).await {
            Ok(data) => data,
            Err(e @ Error::DownloadExhausted { .. }) => {
                self.record_failure(feature.image_id).await;
                return match self.config.on_download_failure {
                    DownloadFailurePolicy::Abort => {
                        error!(error = %e, "giving up");
                        Err(e)
                    }
                    DownloadFailurePolicy::Record => {
                        warn!(error = %e, "skipping image");
                        Ok(FeatureOutcome::Failed)
                    }
                };
            }
            Err(e) => return Err(e),
        };

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let path = self
            .guard
            .admit(self.store.root(), data.len() as u64, || {
                self.store.commit(&feature, &data)
            })
            .await?;

        info!(
            image_id = feature.image_id,
            sequence_id = %feature.sequence_id,
            path = %path.display(),
            "saved image",
        );
        Ok(FeatureOutcome::Downloaded)
    }

    /// A ledger that can't be written must not turn a skipped image into a
    /// failed run.
    async fn record_failure(&self, image_id: u64) {
        if let Err(e) = self.recorder.record(image_id).await {
            error!(image_id, error = %e, "could not record failed image");
        }
    }
}

/// Downloads the images inside the bounding box of `cfg` into its sequence
/// directory, using the public Mapillary endpoints.
///
/// Creates the cache and sequence directories if needed. Images already on
/// disk are skipped unless `cfg.overwrite` is set.
///
/// # Example
/// ```rust,no_run
/// use mapillary_downloader::{fetch, Config, Options};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> mapillary_downloader::Result<()> {
/// let config = Config::resolve(Options {
///     tile_cache_dir: Some("./tiles".into()),
///     seq_dir: Some("./sequences".into()),
///     west: Some(6.031),
///     south: Some(50.7492),
///     east: Some(6.1649),
///     north: Some(50.811),
///     token: Some("MLY|...".to_owned()),
///     ..Options::default()
/// })?;
///
/// let report = fetch(config, &CancellationToken::new(), true).await?;
/// println!("{:?}", report.stats);
/// # Ok(())
/// # }
/// ```
pub async fn fetch(cfg: Config, cancel: &CancellationToken, progress: bool) -> Result<RunReport> {
    let client = Arc::new(ReqwestClient::new(cfg.timeout)?);

    Pipeline::new(cfg, client)
        .show_progress(progress)
        .run(cancel)
        .await
}
