use std::{io, path::PathBuf};

use crate::http::HttpError;
use crate::tile::Tile;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while downloading images.
///
/// Only the startup errors (`InvalidBoundingBox`, `MissingCredential`,
/// `MissingConfig`, `Config`) and, depending on the configured
/// [`DownloadFailurePolicy`](crate::DownloadFailurePolicy), `DownloadExhausted`
/// end a run. The rest are recovered from by skipping the tile or image.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid bounding box: west={west} south={south} east={east} north={north}")]
    InvalidBoundingBox {
        west: f64,
        south: f64,
        east: f64,
        north: f64,
    },

    #[error("no access token given (use --token or --token-file)")]
    MissingCredential,

    #[error("--{0} must be set on the command line or in the config file")]
    MissingConfig(&'static str),

    #[error("invalid configuration in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("failed fetching tile {tile}: {reason}")]
    TileFetch { tile: Tile, reason: String },

    #[error("malformed tile data: {0}")]
    MalformedTileData(String),

    #[error("could not resolve image {image_id} after {attempts} attempts: {reason}")]
    ResolveExhausted {
        image_id: u64,
        attempts: u32,
        reason: String,
    },

    #[error("invalid image payload: {0}")]
    DownloadValidation(String),

    #[error("could not download image {image_id} after {attempts} attempts: {reason}")]
    DownloadExhausted {
        image_id: u64,
        attempts: u32,
        reason: String,
    },

    #[error("insufficient free disk space: {available} bytes available, {required} required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn config(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::Config {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
