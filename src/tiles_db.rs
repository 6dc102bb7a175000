//! Compacting the tile cache into a single image database.
//!
//! The database is a gzip-compressed JSON object keyed by image id, holding
//! what downstream tools need to place an image without the tile files.

use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};
use tracing::{info, warn};

use crate::cache::COVERAGE;
use crate::error::Result;
use crate::feature::FeatureCollection;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub seqid: String,
    pub angle: Option<f64>,
    pub lat: f64,
    pub lon: f64,
    pub is_pano: bool,
}

pub type TilesDb = BTreeMap<u64, ImageRecord>;

/// Collects the images of every cached tile in `dir`. Tiles are read in file
/// name order; a later tile wins if two list the same image.
pub fn collect(dir: &Path) -> Result<TilesDb> {
    let mut paths = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(COVERAGE))
        })
        .collect::<Vec<_>>();
    paths.sort();

    let mut db = TilesDb::new();
    for path in paths {
        let collection = match FeatureCollection::from_json(&fs::read(&path)?) {
            Ok(collection) => collection,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable tile");
                continue;
            }
        };

        for feature in &collection.features {
            let (lon, lat) = feature.coordinates();
            let props = &feature.properties;
            db.insert(
                props.id,
                ImageRecord {
                    seqid: props.sequence_id.clone(),
                    angle: props.compass_angle,
                    lat,
                    lon,
                    is_pano: props.is_pano,
                },
            );
        }
    }

    Ok(db)
}

/// Writes the database of the tiles in `dir` to `output`. Returns the number
/// of images written.
pub fn compact(dir: &Path, output: &Path) -> Result<usize> {
    let db = collect(dir)?;
    info!(entries = db.len(), output = %output.display(), "writing tiles database");

    let mut encoder = GzEncoder::new(BufWriter::new(File::create(output)?), Compression::default());
    serde_json::to_writer(&mut encoder, &db).map_err(std::io::Error::from)?;
    encoder.finish()?.flush()?;

    Ok(db.len())
}
