use std::{f64::consts::PI, fmt, str::FromStr};

/// The only zoom level the image coverage tiles are published at.
pub const ZOOM: u8 = 14;

/// Latitude limit of the web-mercator projection, in degrees.
pub(crate) const LAT_LIMIT: f64 = 85.051129;
const LON_LIMIT: f64 = 180_f64;

const EPSILON: f64 = 1e-14;

/// A web-mercator slippy-map tile with x, y and z-coordinate.
/// ref: https://wiki.openstreetmap.org/wiki/Slippy_map_tilenames
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl Tile {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }

    /// The tile containing the given point (in degrees). Points outside the
    /// projection are clamped onto the outermost tiles.
    pub fn from_coords_and_zoom(lat_deg: f64, lon_deg: f64, zoom: u8) -> Self {
        // scale factor
        let n = 2_f64.powi(zoom as i32);

        let x = lon_deg / 360_f64 + 0.5;
        let sin_lat = lat_deg.to_radians().sin();
        let y = 0.5 - 0.25 * ((1_f64 + sin_lat) / (1_f64 - sin_lat)).ln() / PI;

        Self::new(scale(x, n), scale(y, n), zoom)
    }

    /// Name of this tile inside the tile cache and tile allow-lists,
    /// `<coverage>_<x>_<y>_<z>`.
    pub fn cache_key(&self, coverage: &str) -> String {
        format!("{}_{}_{}_{}", coverage, self.x, self.y, self.z)
    }

    /// Converts a tile-local position (0..`extent` on both axes, y pointing
    /// south) into longitude and latitude in degrees.
    pub fn project(&self, px: f64, py: f64, extent: f64) -> (f64, f64) {
        let n = 2_f64.powi(self.z as i32);
        let lon = (self.x as f64 + px / extent) / n * 360_f64 - 180_f64;
        let merc_y = PI * (1_f64 - 2_f64 * (self.y as f64 + py / extent) / n);
        let lat = merc_y.sinh().atan().to_degrees();

        (lon, lat)
    }
}

fn scale(v: f64, n: f64) -> u32 {
    if v <= 0_f64 {
        0
    } else if v >= 1_f64 {
        n as u32 - 1
    } else {
        ((v + EPSILON) * n).floor() as u32
    }
}

pub(crate) fn clamp_lon(lon: f64) -> f64 {
    lon.max(-LON_LIMIT).min(LON_LIMIT)
}

pub(crate) fn clamp_lat(lat: f64) -> f64 {
    lat.max(-LAT_LIMIT).min(LAT_LIMIT)
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

/// Parses a cache key of the form `<coverage>_<x>_<y>_<z>`. The coverage
/// itself may contain underscores.
impl FromStr for Tile {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().rsplitn(4, '_');
        let z = parts.next().and_then(|v| v.parse().ok());
        let y = parts.next().and_then(|v| v.parse().ok());
        let x = parts.next().and_then(|v| v.parse().ok());

        match (x, y, z, parts.next()) {
            (Some(x), Some(y), Some(z), Some(coverage)) if !coverage.is_empty() => {
                Ok(Tile::new(x, y, z))
            }
            _ => Err("expected <coverage>_<x>_<y>_<z>"),
        }
    }
}
