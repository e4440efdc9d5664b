//! Map tile acquisition engine: enumerate tiles under a geographic mask,
//! fetch them with bounded concurrency, and persist them to an MBTiles
//! archive or a tile directory, with resumable progress.
//!
//! See `SPEC_FULL.md` for the full component breakdown; this crate is the
//! download engine core (§2), not the GUI front-end that would normally
//! drive it.

pub mod config;
pub mod coord;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fetch;
pub mod geometry;
pub mod persistence;
pub mod planner;
pub mod tile;

pub use config::Settings;
pub use coordinator::{Coordinator, TaskState};
pub use error::DownloadError;
pub use events::Event;
