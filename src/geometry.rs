//! GeoJSON mask loading and tile/polygon bounding-box intersection.
//!
//! Grounded on `qt/src/GeoJsonReader.cpp` and `qt/src/Layer.cpp`. Only the
//! outer ring of each polygon is kept (inner rings/holes are ignored — see
//! the REDESIGN note in `SPEC_FULL.md` §9, preserved deliberately) and only
//! `Polygon`/`MultiPolygon` geometries are recognized; everything else the
//! original silently skips, and so do we.

use serde_json::Value;
use tracing::warn;

use crate::coord::tile_bounds;

/// Axis-aligned bounding box in geographic (lon, lat) degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BBox {
    fn from_points<'a>(points: impl Iterator<Item = &'a (f64, f64)>) -> Option<Self> {
        let mut min_lon = f64::MAX;
        let mut min_lat = f64::MAX;
        let mut max_lon = f64::MIN;
        let mut max_lat = f64::MIN;
        let mut any = false;
        for &(lon, lat) in points {
            any = true;
            min_lon = min_lon.min(lon);
            min_lat = min_lat.min(lat);
            max_lon = max_lon.max(lon);
            max_lat = max_lat.max(lat);
        }
        any.then_some(Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        })
    }

    fn union(boxes: impl Iterator<Item = BBox>) -> Option<Self> {
        boxes.fold(None, |acc, b| match acc {
            None => Some(b),
            Some(a) => Some(BBox {
                min_lon: a.min_lon.min(b.min_lon),
                min_lat: a.min_lat.min(b.min_lat),
                max_lon: a.max_lon.max(b.max_lon),
                max_lat: a.max_lat.max(b.max_lat),
            }),
        })
    }

    fn intersects(&self, other: &BBox) -> bool {
        self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
            && self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
    }
}

/// A single polygon's outer ring plus its precomputed bounding box.
#[derive(Debug, Clone)]
pub struct Polygon {
    pub outer_ring: Vec<(f64, f64)>,
    pub bbox: BBox,
}

/// An ordered collection of polygons parsed from GeoJSON, with a union bbox.
///
/// An empty mask (no polygons) means *unbounded*: every tile is a candidate.
#[derive(Debug, Clone, Default)]
pub struct Mask {
    polygons: Vec<Polygon>,
    bounds: Option<BBox>,
}

impl Mask {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    pub fn bounds(&self) -> Option<BBox> {
        self.bounds
    }

    /// Parse a mask from a GeoJSON file on disk.
    ///
    /// Parse failures are non-fatal to the caller: this logs a warning and
    /// returns an empty mask rather than an error, per §4.2 of the spec —
    /// a failed mask must not abort the task.
    pub async fn load(path: &std::path::Path) -> Self {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read mask geojson, treating as empty");
                return Self::empty();
            }
        };
        match Self::parse(&text) {
            Ok(mask) => mask,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse mask geojson, treating as empty");
                Self::empty()
            }
        }
    }

    /// Parse a mask from a GeoJSON string. Supports `FeatureCollection`,
    /// `Feature`, bare `Geometry`, and Nominatim-style `[{ "geojson": {...} }]`
    /// arrays.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let mut polygons = Vec::new();

        match &value {
            Value::Object(obj) => {
                let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
                if kind == "FeatureCollection" {
                    if let Some(features) = obj.get("features").and_then(Value::as_array) {
                        for feature in features {
                            if let Some(geom) = feature.get("geometry") {
                                append_geometry(geom, &mut polygons);
                            }
                        }
                    }
                } else if kind == "Feature" {
                    if let Some(geom) = obj.get("geometry") {
                        append_geometry(geom, &mut polygons);
                    }
                } else if obj.contains_key("type") && obj.contains_key("coordinates") {
                    append_geometry(&value, &mut polygons);
                }
            }
            Value::Array(items) => {
                for item in items {
                    if let Some(geom) = item.get("geojson") {
                        append_geometry(geom, &mut polygons);
                    }
                }
            }
            _ => {}
        }

        let bounds = BBox::union(polygons.iter().map(|p| p.bbox));
        Ok(Self { polygons, bounds })
    }

    /// Does the tile's geographic bbox intersect any polygon's bbox?
    ///
    /// Deliberate over-approximation per §4.2: bbox-vs-bbox only, never a
    /// full polygon-vs-polygon test. An empty mask always returns true.
    pub fn contains_tile(&self, x: i64, y: i64, z: u32) -> bool {
        if self.polygons.is_empty() {
            return true;
        }
        let (lon_w, lat_s, lon_e, lat_n) = tile_bounds(x, y, z);
        let tile_box = BBox {
            min_lon: lon_w,
            min_lat: lat_s,
            max_lon: lon_e,
            max_lat: lat_n,
        };
        self.polygons.iter().any(|p| p.bbox.intersects(&tile_box))
    }
}

fn append_geometry(geom: &Value, out: &mut Vec<Polygon>) {
    let kind = geom.get("type").and_then(Value::as_str).unwrap_or_default();
    let coords = match geom.get("coordinates").and_then(Value::as_array) {
        Some(c) => c,
        None => return,
    };

    match kind {
        "Polygon" => {
            if let Some(poly) = parse_polygon_rings(coords) {
                out.push(poly);
            }
        }
        "MultiPolygon" => {
            for poly_coords in coords {
                if let Some(rings) = poly_coords.as_array() {
                    if let Some(poly) = parse_polygon_rings(rings) {
                        out.push(poly);
                    }
                }
            }
        }
        // Points, LineStrings and anything else contribute no mask polygon,
        // matching the original parser's behavior.
        _ => {}
    }
}

/// Takes a `Polygon`-shaped coordinate array (`[ring, ring, ...]`) and keeps
/// only the outer ring (`ring[0]`), matching `parsePolygonCoordinates`.
fn parse_polygon_rings(rings: &[Value]) -> Option<Polygon> {
    let outer = rings.first()?.as_array()?;
    let outer_ring: Vec<(f64, f64)> = outer
        .iter()
        .filter_map(|pt| {
            let pt = pt.as_array()?;
            if pt.len() < 2 {
                return None;
            }
            Some((pt[0].as_f64()?, pt[1].as_f64()?))
        })
        .collect();
    let bbox = BBox::from_points(outer_ring.iter())?;
    Some(Polygon { outer_ring, bbox })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: &str = r#"{
        "type": "Polygon",
        "coordinates": [[[-10,-10],[10,-10],[10,10],[-10,10],[-10,-10]]]
    }"#;

    #[test]
    fn empty_mask_contains_every_tile() {
        let mask = Mask::empty();
        assert!(mask.contains_tile(0, 0, 0));
        assert!(mask.contains_tile(1000, 1000, 20));
    }

    #[test]
    fn parses_bare_geometry() {
        let mask = Mask::parse(SQUARE).unwrap();
        assert_eq!(mask.polygons().len(), 1);
        let b = mask.bounds().unwrap();
        assert_eq!((b.min_lon, b.min_lat, b.max_lon, b.max_lat), (-10.0, -10.0, 10.0, 10.0));
    }

    #[test]
    fn parses_feature_and_feature_collection() {
        let feature = format!(r#"{{"type":"Feature","geometry":{}}}"#, SQUARE);
        assert_eq!(Mask::parse(&feature).unwrap().polygons().len(), 1);

        let fc = format!(
            r#"{{"type":"FeatureCollection","features":[{{"type":"Feature","geometry":{}}}]}}"#,
            SQUARE
        );
        assert_eq!(Mask::parse(&fc).unwrap().polygons().len(), 1);
    }

    #[test]
    fn parses_nominatim_array() {
        let arr = format!(r#"[{{"geojson":{}}}]"#, SQUARE);
        assert_eq!(Mask::parse(&arr).unwrap().polygons().len(), 1);
    }

    #[test]
    fn small_square_mask_yields_expected_candidate_set_at_zoom_2() {
        let mask = Mask::parse(SQUARE).unwrap();
        let z = 2;
        let n = crate::coord::tiles_per_axis(z) as i64;
        let mut candidates = Vec::new();
        for x in 0..n {
            for y in 0..n {
                if mask.contains_tile(x, y, z) {
                    candidates.push((x, y));
                }
            }
        }
        candidates.sort();
        assert_eq!(candidates, vec![(1, 1), (1, 2), (2, 1), (2, 2)]);
    }

    #[test]
    fn ignores_inner_rings() {
        let with_hole = r#"{
            "type": "Polygon",
            "coordinates": [
                [[-10,-10],[10,-10],[10,10],[-10,10],[-10,-10]],
                [[-1,-1],[1,-1],[1,1],[-1,1],[-1,-1]]
            ]
        }"#;
        let mask = Mask::parse(with_hole).unwrap();
        assert_eq!(mask.polygons()[0].outer_ring.len(), 5);
    }

    #[test]
    fn invalid_json_is_a_parse_error_not_a_panic() {
        assert!(Mask::parse("not json").is_err());
    }
}
