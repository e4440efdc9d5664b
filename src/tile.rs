//! `Tile` and `TileSource` value types.
//!
//! Grounded on `qt/include/Tile.h` and `qt/include/TileMap.h`.

use crate::coord::{url_of, TileCoord};

/// A tile's content in transit: produced by the planner as a bare
/// coordinate, populated by fetch, consumed by persistence, then discarded.
#[derive(Debug, Clone)]
pub struct Tile {
    pub coord: TileCoord,
    pub bytes: Option<Vec<u8>>,
}

impl Tile {
    pub fn new(coord: TileCoord) -> Self {
        Self { coord, bytes: None }
    }
}

/// Raster/vector tile content format, stamped into MBTiles metadata and used
/// as the filesystem output extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileFormat {
    Png,
    Jpg,
    Pbf,
    Webp,
}

impl TileFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Jpg => "jpg",
            TileFormat::Pbf => "pbf",
            TileFormat::Webp => "webp",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "png" => TileFormat::Png,
            "pbf" => TileFormat::Pbf,
            "webp" => TileFormat::Webp,
            // The original defaults to jpg for anything it doesn't recognize
            // among its four constants.
            _ => TileFormat::Jpg,
        }
    }
}

/// Tile addressing convention stamped into MBTiles `metadata.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Xyz,
    Tms,
}

impl Schema {
    pub fn as_str(self) -> &'static str {
        match self {
            Schema::Xyz => "xyz",
            Schema::Tms => "tms",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tms" => Schema::Tms,
            _ => Schema::Xyz,
        }
    }
}

/// Immutable description of the tile origin: URL template, schema, format,
/// and the metadata stamped into an MBTiles archive at init.
#[derive(Debug, Clone)]
pub struct TileSource {
    pub url_template: String,
    pub schema: Schema,
    pub format: TileFormat,
    pub name: String,
    pub description: String,
    pub min_zoom: u32,
    pub max_zoom: u32,
    pub json: Option<String>,
}

impl TileSource {
    /// Resolve the URL for a tile, using `override_template` in place of the
    /// source's own template when a layer provides one.
    pub fn url_for(&self, override_template: Option<&str>, coord: TileCoord) -> String {
        let template = override_template.unwrap_or(&self.url_template);
        url_of(template, coord.z, coord.x, coord.y)
    }
}
