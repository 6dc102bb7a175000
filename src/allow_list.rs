//! Loading the optional image-id and tile allow-lists.

use serde::Deserialize;
use std::{collections::HashSet, fs, path::Path};
use tracing::info;

use crate::error::{Error, Result};

#[derive(Deserialize)]
#[serde(untagged)]
enum IdValue {
    Number(u64),
    Text(String),
}

#[derive(Deserialize)]
struct ImageIdEntry {
    mapillary_img_id: IdValue,
}

/// Reads image ids from `path`. Files ending in `.json` hold an array of
/// objects with a `mapillary_img_id` field, anything else one id per line.
pub fn load_image_ids(path: &Path) -> Result<HashSet<u64>> {
    let text = fs::read_to_string(path).map_err(|e| Error::config(path, e))?;

    let ids = if path.extension().map_or(false, |ext| ext == "json") {
        info!(path = %path.display(), "reading image ids from JSON objects");
        let entries: Vec<ImageIdEntry> =
            serde_json::from_str(&text).map_err(|e| Error::config(path, e))?;
        entries
            .into_iter()
            .map(|entry| match entry.mapillary_img_id {
                IdValue::Number(id) => Ok(id),
                IdValue::Text(s) => s
                    .trim()
                    .parse()
                    .map_err(|_| Error::config(path, format!("invalid image id {:?}", s))),
            })
            .collect::<Result<HashSet<_>>>()?
    } else {
        info!(path = %path.display(), "reading image ids, one per line");
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.parse()
                    .map_err(|_| Error::config(path, format!("invalid image id {:?}", line)))
            })
            .collect::<Result<HashSet<_>>>()?
    };

    info!(count = ids.len(), "loaded image allow-list");
    Ok(ids)
}

/// Reads tile cache keys (`<coverage>_<x>_<y>_<z>`), one per line.
pub fn load_tile_keys(path: &Path) -> Result<HashSet<String>> {
    let text = fs::read_to_string(path).map_err(|e| Error::config(path, e))?;

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}
