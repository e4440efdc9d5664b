//! Layer Planner: candidate tile enumeration and count estimation.
//!
//! Grounded on `qt/src/Layer.cpp::calculateTileCount` (estimate) and the
//! nested-loop enumeration in `qt/src/Task.cpp::downloadTiles`.

use crate::coord::{lat2row, lon2col, tiles_per_axis, TileCoord};
use crate::geometry::Mask;

/// `(zoom, url_override?, mask)` — built by the coordinator at task start,
/// consumed by the planner, discarded when the layer completes.
#[derive(Debug, Clone)]
pub struct Layer {
    pub zoom: u32,
    pub url_override: Option<String>,
    pub mask: Mask,
}

impl Layer {
    pub fn new(zoom: u32, mask: Mask) -> Self {
        Self {
            zoom,
            url_override: None,
            mask,
        }
    }

    /// Upper-bound estimate of the candidate tile count, used to seed
    /// progress before any enumeration or I/O happens.
    pub fn estimate(&self) -> i64 {
        if self.mask.is_empty() {
            let n = tiles_per_axis(self.zoom) as i64;
            return n * n;
        }

        let n = tiles_per_axis(self.zoom) as i64;
        let max_idx = n - 1;
        let mut total: i64 = 0;
        for poly in self.mask.polygons() {
            let b = poly.bbox;
            let min_x = lon2col(b.min_lon, self.zoom).clamp(0, max_idx);
            let max_x = lon2col(b.max_lon, self.zoom).clamp(0, max_idx);
            // Latitude decreases as row increases, so the north edge (max_lat)
            // gives the smaller row and the south edge the larger one.
            let min_y = lat2row(b.max_lat, self.zoom).clamp(0, max_idx);
            let max_y = lat2row(b.min_lat, self.zoom).clamp(0, max_idx);
            total += (max_x - min_x + 1) * (max_y - min_y + 1);
        }
        total
    }

    /// Enumerate every candidate tile, `x` outer, `y` inner, deterministic.
    pub fn enumerate(&self) -> impl Iterator<Item = TileCoord> + '_ {
        let n = tiles_per_axis(self.zoom);
        (0..n).flat_map(move |x| {
            (0..n).filter_map(move |y| {
                if self.mask.contains_tile(x as i64, y as i64, self.zoom) {
                    Some(TileCoord::new(self.zoom, x as u32, y as u32))
                } else {
                    None
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Mask;

    #[test]
    fn estimate_empty_mask_is_4_pow_zoom() {
        let layer = Layer::new(4, Mask::empty());
        assert_eq!(layer.estimate(), 4i64.pow(4));
    }

    #[test]
    fn enumerate_empty_mask_yields_every_tile_in_xy_order() {
        let layer = Layer::new(2, Mask::empty());
        let tiles: Vec<_> = layer.enumerate().collect();
        assert_eq!(tiles.len(), 16);
        assert_eq!((tiles[0].x, tiles[0].y), (0, 0));
        assert_eq!((tiles[1].x, tiles[1].y), (0, 1));
        assert_eq!((tiles[4].x, tiles[4].y), (1, 0));
    }

    #[test]
    fn enumerate_masked_layer_matches_scenario_2() {
        let square = r#"{"type":"Polygon","coordinates":[[[-10,-10],[10,-10],[10,10],[-10,10],[-10,-10]]]}"#;
        let mask = Mask::parse(square).unwrap();
        let layer = Layer::new(2, mask);
        let mut coords: Vec<_> = layer.enumerate().map(|t| (t.x, t.y)).collect();
        coords.sort();
        assert_eq!(coords, vec![(1, 1), (1, 2), (2, 1), (2, 2)]);
        assert_eq!(layer.estimate(), 4);
    }
}
