use serde::Deserialize;
use std::{collections::HashSet, fs, path::Path, path::PathBuf, time::Duration};
use tracing::info;

use crate::allow_list::{load_image_ids, load_tile_keys};
use crate::bounding_box::BoundingBox;
use crate::download::DownloadFailurePolicy;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::tile::Tile;

const BYTES_PER_GB: u64 = 1_000_000_000;

/// The JSON configuration file. Every value can be overridden from the
/// command line; unknown keys are ignored so the file can be shared with
/// other tools.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub tile_cache_dir: Option<PathBuf>,
    pub seqdir: Option<PathBuf>,
    #[serde(default)]
    pub bounding_box: PartialBoundingBox,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialBoundingBox {
    pub west: Option<f64>,
    pub south: Option<f64>,
    pub east: Option<f64>,
    pub north: Option<f64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::config(path, e))?;
        serde_json::from_str(&text).map_err(|e| Error::config(path, e))
    }
}

/// Settings as given on the command line, before merging with the
/// configuration file.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    pub config_file: Option<PathBuf>,
    pub tile_cache_dir: Option<PathBuf>,
    pub seq_dir: Option<PathBuf>,
    pub west: Option<f64>,
    pub south: Option<f64>,
    pub east: Option<f64>,
    pub north: Option<f64>,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub tile_list_file: Option<PathBuf>,
    pub image_id_file: Option<PathBuf>,
    pub failed_image_id_file: Option<PathBuf>,
    pub required_disk_space_gb: u64,
    pub retries: u32,
    pub overwrite: bool,
    pub tiles_only: bool,
    pub parallel_downloads: usize,
    pub timeout: Duration,
    pub on_download_failure: DownloadFailurePolicy,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config_file: None,
            tile_cache_dir: None,
            seq_dir: None,
            west: None,
            south: None,
            east: None,
            north: None,
            token: None,
            token_file: Some(PathBuf::from("token.txt")),
            tile_list_file: None,
            image_id_file: None,
            failed_image_id_file: None,
            required_disk_space_gb: 100,
            retries: 8,
            overwrite: false,
            tiles_only: false,
            parallel_downloads: 1,
            timeout: Duration::from_secs(30),
            on_download_failure: DownloadFailurePolicy::Abort,
        }
    }
}

impl Options {
    fn config_file(&self) -> Result<ConfigFile> {
        match &self.config_file {
            Some(path) => ConfigFile::load(path),
            None => Ok(ConfigFile::default()),
        }
    }

    fn merge_bounding_box(&self, file: &PartialBoundingBox) -> Result<BoundingBox> {
        BoundingBox::new(
            resolve_field(self.west, file.west, "west")?,
            resolve_field(self.south, file.south, "south")?,
            resolve_field(self.east, file.east, "east")?,
            resolve_field(self.north, file.north, "north")?,
        )
    }

    /// Resolves just the bounding box, for when nothing is going to be
    /// downloaded.
    pub fn bounding_box(&self) -> Result<BoundingBox> {
        self.merge_bounding_box(&self.config_file()?.bounding_box)
    }
}

/// Fully resolved download configuration. Built once at startup and only
/// read afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Where decoded coverage tiles are cached.
    pub tile_cache_dir: PathBuf,

    /// Root of the per-sequence image directories.
    pub seq_dir: PathBuf,

    pub bounding_box: BoundingBox,

    pub access_token: String,

    /// Stop once less than this many bytes are free on the image disk.
    pub required_free_space: u64,

    pub retry: RetryPolicy,

    /// Refetch cached tiles and re-download images that already exist.
    pub overwrite: bool,

    /// Only fill the tile cache, don't touch images.
    pub tiles_only: bool,

    /// Only download these images. `None` means no restriction.
    pub allowed_image_ids: Option<HashSet<u64>>,

    /// Only process tiles with these cache keys. `None` means no restriction.
    pub allowed_tiles: Option<HashSet<String>>,

    /// Ledger receiving the ids of images that could not be downloaded.
    pub failed_image_id_file: Option<PathBuf>,

    /// Maximum number of images of one tile processed in parallel.
    pub parallel_downloads: usize,

    /// Timeout for a single HTTP request. Zero disables it.
    pub timeout: Duration,

    pub on_download_failure: DownloadFailurePolicy,
}

/// Picks the command-line value over the config-file value, failing if
/// neither is set.
pub fn resolve_field<T>(cli: Option<T>, file: Option<T>, name: &'static str) -> Result<T> {
    cli.or(file).ok_or(Error::MissingConfig(name))
}

/// The explicit token if given, otherwise the first non-empty line of the
/// token file.
pub fn read_token(token: Option<&str>, token_file: Option<&Path>) -> Result<String> {
    if let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(token.to_owned());
    }

    let path = match token_file {
        Some(path) if path.exists() => path,
        _ => return Err(Error::MissingCredential),
    };

    let text = fs::read_to_string(path).map_err(|e| Error::config(path, e))?;
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_owned)
        .ok_or(Error::MissingCredential)
}

impl Config {
    /// Merges `opts` over the configuration file it names (if any) and loads
    /// the allow-lists.
    pub fn resolve(opts: Options) -> Result<Self> {
        let file = opts.config_file()?;
        let bounding_box = opts.merge_bounding_box(&file.bounding_box)?;

        let tile_cache_dir = resolve_field(opts.tile_cache_dir, file.tile_cache_dir, "tile-cache-dir")?;
        let seq_dir = resolve_field(opts.seq_dir, file.seqdir, "seqdir")?;
        let access_token = read_token(opts.token.as_deref(), opts.token_file.as_deref())?;

        let allowed_image_ids = match &opts.image_id_file {
            Some(path) => Some(load_image_ids(path)?).filter(|ids| !ids.is_empty()),
            None => None,
        };
        let allowed_tiles = match &opts.tile_list_file {
            Some(path) => Some(load_tile_keys(path)?),
            None => None,
        };

        let config = Config {
            tile_cache_dir,
            seq_dir,
            bounding_box,
            access_token,
            required_free_space: opts.required_disk_space_gb.saturating_mul(BYTES_PER_GB),
            retry: RetryPolicy::new(opts.retries),
            overwrite: opts.overwrite,
            tiles_only: opts.tiles_only,
            allowed_image_ids,
            allowed_tiles,
            failed_image_id_file: opts.failed_image_id_file,
            parallel_downloads: opts.parallel_downloads.max(1),
            timeout: opts.timeout,
            on_download_failure: opts.on_download_failure,
        };

        info!(
            tile_cache_dir = %config.tile_cache_dir.display(),
            seq_dir = %config.seq_dir.display(),
            west = config.bounding_box.west,
            south = config.bounding_box.south,
            east = config.bounding_box.east,
            north = config.bounding_box.north,
            required_disk_space = %pretty_bytes::converter::convert(config.required_free_space as f64),
            retries = config.retry.retries,
            "resolved configuration",
        );

        Ok(config)
    }

    /// Creates a list of all tiles in the contained bounding box.
    pub fn tiles(&self) -> Vec<Tile> {
        self.bounding_box.tiles()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    fn base_opts(dir: &Path) -> Options {
        Options {
            token: Some("tok".to_owned()),
            token_file: None,
            tile_cache_dir: Some(dir.join("tiles")),
            seq_dir: Some(dir.join("seqs")),
            west: Some(4.0),
            south: Some(52.0),
            east: Some(5.0),
            north: Some(53.0),
            ..Options::default()
        }
    }

    #[test]
    fn command_line_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = write(
            dir.path(),
            "config.json",
            r#"{"tile_cache_dir": "/from/file", "seqdir": "/seq/file",
                "bounding_box": {"west": 1.0, "south": 2.0, "east": 3.0, "north": 4.0},
                "other_tool": {"interval": 50}}"#,
        );

        let config = Config::resolve(Options {
            config_file: Some(config_file),
            tile_cache_dir: Some("/from/cli".into()),
            east: Some(3.5),
            token: Some("tok".to_owned()),
            ..Options::default()
        })
        .unwrap();

        assert_eq!(config.tile_cache_dir, PathBuf::from("/from/cli"));
        assert_eq!(config.seq_dir, PathBuf::from("/seq/file"));
        assert_eq!(config.bounding_box, BoundingBox::new(1.0, 2.0, 3.5, 4.0).unwrap());
        assert_eq!(config.required_free_space, 100 * BYTES_PER_GB);
        assert_eq!(config.retry.retries, 8);
    }

    #[test]
    fn missing_value_names_the_field() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options {
            north: None,
            ..base_opts(dir.path())
        };
        assert!(matches!(Config::resolve(opts), Err(Error::MissingConfig("north"))));

        let opts = Options {
            seq_dir: None,
            ..base_opts(dir.path())
        };
        assert!(matches!(Config::resolve(opts), Err(Error::MissingConfig("seqdir"))));
    }

    #[test]
    fn inverted_box_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options {
            west: Some(6.0),
            ..base_opts(dir.path())
        };
        assert!(matches!(
            Config::resolve(opts),
            Err(Error::InvalidBoundingBox { .. })
        ));
    }

    #[test]
    fn token_sources() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "token.txt", "\n  MLY|123|abc  \nsecond\n");

        assert_eq!(read_token(Some("direct"), Some(&file)).unwrap(), "direct");
        assert_eq!(read_token(None, Some(&file)).unwrap(), "MLY|123|abc");
        assert!(matches!(
            read_token(None, Some(&dir.path().join("nope.txt"))),
            Err(Error::MissingCredential)
        ));
        assert!(matches!(read_token(Some("  "), None), Err(Error::MissingCredential)));

        let empty = write(dir.path(), "empty.txt", "\n\n");
        assert!(matches!(read_token(None, Some(&empty)), Err(Error::MissingCredential)));
    }

    #[test]
    fn allow_lists_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let ids = write(dir.path(), "ids.txt", "101\n202\n");
        let tiles = write(dir.path(), "tiles.txt", "mly1_public_1_2_14\n");
        let empty = write(dir.path(), "empty.txt", "");

        let config = Config::resolve(Options {
            image_id_file: Some(ids),
            tile_list_file: Some(tiles),
            ..base_opts(dir.path())
        })
        .unwrap();
        assert_eq!(config.allowed_image_ids.unwrap().len(), 2);
        assert!(config.allowed_tiles.unwrap().contains("mly1_public_1_2_14"));

        let config = Config::resolve(Options {
            image_id_file: Some(empty),
            ..base_opts(dir.path())
        })
        .unwrap();
        assert_eq!(config.allowed_image_ids, None);
    }

    #[test]
    fn bounding_box_needs_no_token() {
        let opts = Options {
            west: Some(4.0),
            south: Some(52.0),
            east: Some(5.0),
            north: Some(53.0),
            token_file: None,
            ..Options::default()
        };
        assert_eq!(opts.bounding_box().unwrap(), BoundingBox::new(4.0, 52.0, 5.0, 53.0).unwrap());
        assert!(matches!(Config::resolve(opts), Err(Error::MissingConfig(_))));
    }

    #[test]
    fn resolve_field_precedence() {
        assert_eq!(resolve_field(Some(1), Some(2), "x").unwrap(), 1);
        assert_eq!(resolve_field(None, Some(2), "x").unwrap(), 2);
        assert!(matches!(
            resolve_field::<u8>(None, None, "x"),
            Err(Error::MissingConfig("x"))
        ));
    }
}
