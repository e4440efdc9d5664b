//! Typed error hierarchy for the download engine.
//!
//! Library code returns `Result<_, DownloadError>`; the binary boundary
//! collapses these into `anyhow::Error` the way `anyhow` is meant to be used.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("tile map url template is empty")]
    MissingUrlTemplate,

    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open archive {path}: {source}")]
    ArchiveOpen {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("archive write failed: {0}")]
    ArchiveWrite(#[source] sqlx::Error),

    #[error("failed to open progress ledger {path}: {source}")]
    LedgerOpen {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("ledger write failed: {0}")]
    LedgerWrite(#[source] sqlx::Error),

    #[error("tile write failed at {path}: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}
