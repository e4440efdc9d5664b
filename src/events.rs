//! The typed event surface emitted to embedders (§6).
//!
//! Mirrors the original's Qt signals (`progressUpdated`, `tileDownloaded`,
//! etc.) one-to-one, as an enum pushed onto an `mpsc` channel instead of
//! connected slots.

#[derive(Debug, Clone)]
pub enum Event {
    ProgressUpdated { current: i64, total: i64 },
    LayerProgressUpdated { zoom: u32, current: i64, total: i64 },
    TileDownloaded { z: u32, x: u32, y: u32, bytes: usize, millis: u64 },
    LayerCompleted { zoom: u32, count: i64 },
    TaskCompleted,
    ErrorOccurred { message: String },
    StatusChanged { text: String },
}
