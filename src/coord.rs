//! Web-Mercator tile-index math, XYZ/TMS conversion and URL templating.
//!
//! Mirrors `qt/src/Utils.cpp` (`replaceTileUrl`, `flipY`) and `qt/src/Layer.cpp`
//! (`lon2tile`/`lat2tile`/`getTileBounds`) from the original implementation.

use std::f64::consts::PI;

/// Maximum zoom level this engine will operate at. The original source
/// validates `z <= 30` in `Tile::isValid`.
pub const MAX_ZOOM: u32 = 30;

/// A single tile coordinate. `0 <= z <= MAX_ZOOM`, `0 <= x, y < 2^z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    pub fn is_valid(&self) -> bool {
        if self.z > MAX_ZOOM {
            return false;
        }
        let bound = 1u64 << self.z;
        (self.x as u64) < bound && (self.y as u64) < bound
    }

    /// TMS row, the flipped complement of the XYZ row at this zoom.
    pub fn row_tms(&self) -> u32 {
        flip_y(self.y, self.z)
    }
}

/// Number of tiles along one axis at zoom `z`: `2^z`.
pub fn tiles_per_axis(z: u32) -> u64 {
    1u64 << z
}

/// Longitude (degrees) -> tile column at zoom `z`.
pub fn lon2col(lon: f64, z: u32) -> i64 {
    let n = tiles_per_axis(z) as f64;
    ((lon + 180.0) / 360.0 * n).floor() as i64
}

/// Latitude (degrees) -> tile row (XYZ, north-origin) at zoom `z`.
pub fn lat2row(lat: f64, z: u32) -> i64 {
    let n = tiles_per_axis(z) as f64;
    let lat_rad = lat * PI / 180.0;
    (((1.0 - lat_rad.tan().asinh() / PI) / 2.0) * n).floor() as i64
}

/// Tile column -> west edge longitude (degrees) at zoom `z`.
pub fn col2lon(x: i64, z: u32) -> f64 {
    let n = tiles_per_axis(z) as f64;
    x as f64 * 360.0 / n - 180.0
}

/// Tile row (XYZ) -> north edge latitude (degrees) at zoom `z`.
pub fn row2lat(y: i64, z: u32) -> f64 {
    let n = tiles_per_axis(z) as f64;
    let arg = PI - 2.0 * PI * y as f64 / n;
    arg.sinh().atan() * 180.0 / PI
}

/// Geographic bounding box of tile `(x, y)` at zoom `z`: `(lon_w, lat_s, lon_e, lat_n)`.
pub fn tile_bounds(x: i64, y: i64, z: u32) -> (f64, f64, f64, f64) {
    let lon_w = col2lon(x, z);
    let lon_e = col2lon(x + 1, z);
    let lat_n = row2lat(y, z);
    let lat_s = row2lat(y + 1, z);
    (lon_w, lat_s, lon_e, lat_n)
}

/// Flip between XYZ and TMS row conventions: `2^z - 1 - y`. Self-inverse.
pub fn flip_y(y: u32, z: u32) -> u32 {
    let max_idx = (tiles_per_axis(z) - 1) as u32;
    max_idx - y
}

/// Substitute `{z}`, `{x}`, `{y}` and `{-y}` (TMS row) in a URL template.
/// No other placeholders are recognized.
pub fn url_of(template: &str, z: u32, x: u32, y: u32) -> String {
    template
        .replace("{z}", &z.to_string())
        .replace("{x}", &x.to_string())
        .replace("{y}", &y.to_string())
        .replace("{-y}", &flip_y(y, z).to_string())
}
