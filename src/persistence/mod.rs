pub mod archive;
pub mod ledger;

pub use archive::TileArchive;
pub use ledger::ProgressLedger;
