use maplit::hashmap;
use strfmt::strfmt;

use crate::error::{Error, Result};
use crate::tile::Tile;

/// Vector tile endpoint of the coverage tiles.
pub const TILE_URL: &str =
    "https://tiles.mapillary.com/maps/vtp/{coverage}/2/{z}/{x}/{y}?access_token={token}";

/// Graph API endpoint resolving an image id to its original-resolution URL.
pub const IMAGE_URL: &str = "https://graph.mapillary.com/{id}?fields=thumb_original_url";

/// A URL template with `{name}` format specifiers.
#[derive(Clone, Debug, PartialEq)]
pub struct UrlFormat {
    format_str: String,
}

impl UrlFormat {
    pub fn from_str(format_str: impl Into<String>) -> Self {
        Self {
            format_str: format_str.into(),
        }
    }

    /// Expands `{coverage}`, `{x}`, `{y}`, `{z}` and `{token}`.
    pub fn tile_url(&self, tile: &Tile, coverage: &str, token: &str) -> Result<String> {
        let vars = hashmap! {
            "coverage".to_owned() => coverage.to_owned(),
            "x".to_owned() => tile.x.to_string(),
            "y".to_owned() => tile.y.to_string(),
            "z".to_owned() => tile.z.to_string(),
            "token".to_owned() => token.to_owned(),
        };

        strfmt(&self.format_str, &vars).map_err(|e| Error::TileFetch {
            tile: *tile,
            reason: format!("failed formatting URL: {}", e),
        })
    }

    /// Expands `{id}`.
    pub fn image_url(&self, image_id: u64) -> Result<String> {
        let vars = hashmap! {
            "id".to_owned() => image_id.to_string(),
        };

        strfmt(&self.format_str, &vars).map_err(|e| Error::ResolveExhausted {
            image_id,
            attempts: 0,
            reason: format!("failed formatting URL: {}", e),
        })
    }
}
