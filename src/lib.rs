//! Download Mapillary street-level images inside a bounding box to your disk.
//!
//! The bounding box is covered with zoom-14 coverage tiles. Each tile's image
//! points are cached on disk, narrowed down to the box (and an optional
//! allow-list), and every image that isn't stored yet is resolved through the
//! Graph API, downloaded, checked to be a complete JPEG and saved as
//! `<seqdir>/<sequence id>/<image id>.jpg`.
//!
//! Runs are resumable: cached tiles and valid images on disk are never
//! fetched again unless `--overwrite` is given. When free disk space drops
//! below the configured floor the run stops cleanly, so it can be continued
//! later.
//!
//! # CLI Example
//!
//! ```bash
//! mapillary-downloader \
//!   --token-file token.txt \
//!   --tile-cache-dir ./tiles \
//!   --seqdir ./sequences \
//!   --west 6.031 \
//!   --south 50.7492 \
//!   --east 6.1649 \
//!   --north 50.811 \
//!   --failed-imgid-file failed.txt
//! ```
//!
//! Directories and the bounding box can also come from a JSON file passed
//! with `--config`:
//!
//! ```json
//! {
//!   "tile_cache_dir": "./tiles",
//!   "seqdir": "./sequences",
//!   "bounding_box": { "west": 6.031, "south": 50.7492, "east": 6.1649, "north": 50.811 }
//! }
//! ```
//!
//! # Library Example
//! ```rust,no_run
//! use mapillary_downloader::{fetch, Config, Options, Outcome};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> mapillary_downloader::Result<()> {
//! let config = Config::resolve(Options {
//!     config_file: Some("config.json".into()),
//!     ..Options::default()
//! })?;
//!
//! let report = fetch(config, &CancellationToken::new(), false).await?;
//! assert_eq!(report.outcome, Outcome::Completed);
//! # Ok(())
//! # }
//! ```

mod allow_list;
mod bounding_box;
mod cache;
mod config;
mod disk;
mod download;
mod error;
mod feature;
mod fetch;
mod http;
mod ledger;
mod resolver;
mod retry;
mod store;
mod tile;
mod tiles_db;
mod url;

pub use allow_list::{load_image_ids, load_tile_keys};
pub use bounding_box::BoundingBox;
pub use cache::{TileCache, COVERAGE, IMAGE_LAYER};
pub use config::{read_token, resolve_field, Config, ConfigFile, Options, PartialBoundingBox};
pub use disk::{DiskSpaceGuard, SpaceProbe, StatvfsProbe};
pub use download::{DownloadFailurePolicy, ImageDownloader};
pub use error::{Error, Result};
pub use feature::{
    decode_vector_tile, Feature, FeatureCollection, FeatureFilter, GeoFeature, ImageProperties,
};
pub use fetch::{fetch, Outcome, Pipeline, RunReport, RunStats};
pub use http::{HttpClient, HttpError, ReqwestClient};
pub use ledger::FailureRecorder;
pub use resolver::ImageResolver;
pub use retry::{RetryError, RetryPolicy, BACKOFF_DELAY};
pub use store::{validate_image, SequenceStore, IMAGE_EXT};
pub use tile::{Tile, ZOOM};
pub use tiles_db::{compact, ImageRecord, TilesDb};
pub use url::{UrlFormat, IMAGE_URL, TILE_URL};
