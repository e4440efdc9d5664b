//! Progress ledger: `(z, x, y, downloaded_at)` records used for resume.
//!
//! Grounded on `qt/src/Task.cpp::setupProgressDatabase/isTileDownloaded/
//! markTileAsDownloaded`. Exists only when resume mode is enabled.

use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::coord::TileCoord;
use crate::error::DownloadError;

pub struct ProgressLedger {
    pool: Mutex<SqlitePool>,
}

impl ProgressLedger {
    /// Open (creating if absent) the ledger at `path`. If `resume` is false,
    /// any pre-existing ledger file there is deleted first, per §4.4.
    pub async fn open(path: &Path, resume: bool) -> Result<Self, DownloadError> {
        if !resume && tokio::fs::try_exists(path).await.unwrap_or(false) {
            tokio::fs::remove_file(path).await.ok();
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DownloadError::OutputDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| DownloadError::LedgerOpen {
                path: path.to_path_buf(),
                source,
            })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS downloaded_tiles (\
                z INTEGER NOT NULL, \
                x INTEGER NOT NULL, \
                y INTEGER NOT NULL, \
                downloaded_at DATETIME DEFAULT CURRENT_TIMESTAMP, \
                PRIMARY KEY (z, x, y))",
        )
        .execute(&pool)
        .await
        .map_err(DownloadError::LedgerWrite)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tile ON downloaded_tiles(z, x, y)")
            .execute(&pool)
            .await
            .map_err(DownloadError::LedgerWrite)?;

        Ok(Self {
            pool: Mutex::new(pool),
        })
    }

    pub async fn is_done(&self, coord: TileCoord) -> Result<bool, DownloadError> {
        let pool = self.pool.lock().await;
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM downloaded_tiles WHERE z = ? AND x = ? AND y = ?",
        )
        .bind(coord.z as i64)
        .bind(coord.x as i64)
        .bind(coord.y as i64)
        .fetch_one(&*pool)
        .await
        .map_err(DownloadError::LedgerWrite)?;
        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    pub async fn mark(&self, coord: TileCoord) -> Result<(), DownloadError> {
        let pool = self.pool.lock().await;
        sqlx::query("INSERT OR IGNORE INTO downloaded_tiles (z, x, y) VALUES (?, ?, ?)")
            .bind(coord.z as i64)
            .bind(coord.x as i64)
            .bind(coord.y as i64)
            .execute(&*pool)
            .await
            .map_err(DownloadError::LedgerWrite)?;
        Ok(())
    }
}

/// `<output.directory>/<task_name>.progress.db`.
pub fn ledger_path(output_directory: &Path, task_name: &str) -> PathBuf {
    output_directory.join(format!("{task_name}.progress.db"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mark_and_is_done_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(dir.path(), "t");
        let ledger = ProgressLedger::open(&path, true).await.unwrap();

        let coord = TileCoord::new(2, 1, 1);
        assert!(!ledger.is_done(coord).await.unwrap());
        ledger.mark(coord).await.unwrap();
        assert!(ledger.is_done(coord).await.unwrap());

        // Duplicate mark is a no-op thanks to INSERT OR IGNORE.
        ledger.mark(coord).await.unwrap();
    }

    #[tokio::test]
    async fn non_resume_open_deletes_preexisting_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = ledger_path(dir.path(), "t");
        {
            let ledger = ProgressLedger::open(&path, true).await.unwrap();
            ledger.mark(TileCoord::new(1, 0, 0)).await.unwrap();
        }
        let ledger = ProgressLedger::open(&path, false).await.unwrap();
        assert!(!ledger.is_done(TileCoord::new(1, 0, 0)).await.unwrap());
    }
}
