use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tile::{clamp_lat, clamp_lon, Tile, ZOOM};

/// Nudges the east/south edges inwards so a box ending exactly on a tile
/// border does not pull in the neighbouring tile.
const EDGE_EPSILON: f64 = 1e-11;

/// A bounding box consisting of west, south, east and north coordinate
/// boundaries given in degrees.
///
/// # Example
/// ```rust
/// # use mapillary_downloader::BoundingBox;
/// let amsterdam = BoundingBox::new(4.7149, 52.2818, 5.1220, 52.4284).unwrap();
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    /// Create a new bounding box from coordinates specified in degrees.
    ///
    /// Fails if `west >= east` or `south >= north`; boxes crossing the
    /// antimeridian are not supported.
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self> {
        let valid = west.is_finite()
            && south.is_finite()
            && east.is_finite()
            && north.is_finite()
            && west < east
            && south < north;

        if !valid {
            return Err(Error::InvalidBoundingBox {
                west,
                south,
                east,
                north,
            });
        }

        Ok(BoundingBox {
            west,
            south,
            east,
            north,
        })
    }

    /// Whether the point lies strictly inside the box. Points on the border
    /// are outside.
    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        self.west < lng && lng < self.east && self.south < lat && lat < self.north
    }

    /// All tiles at the coverage zoom level intersecting the box, column by
    /// column from the north-west corner.
    pub fn tiles(&self) -> Vec<Tile> {
        self.tiles_at(ZOOM)
    }

    pub(crate) fn tiles_at(&self, zoom: u8) -> Vec<Tile> {
        let (w, s) = (clamp_lon(self.west), clamp_lat(self.south));
        let (e, n) = (clamp_lon(self.east), clamp_lat(self.north));

        let nw = Tile::from_coords_and_zoom(n, w, zoom);
        let se = Tile::from_coords_and_zoom(s + EDGE_EPSILON, e - EDGE_EPSILON, zoom);

        ((nw.x)..=(se.x))
            .flat_map(move |x| ((nw.y)..=(se.y)).map(move |y| Tile::new(x, y, zoom)))
            .collect()
    }
}
