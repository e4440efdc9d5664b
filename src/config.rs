//! Configuration loading: TOML -> typed `Settings`.
//!
//! Grounded on `qt/include/Config.h`'s struct shapes (`AppConfig`,
//! `LogConfig`, `OutputConfig`, `TaskConfig`, `TileMapConfig`, `LayerConfig`),
//! redesigned to deserialize with `serde`/`toml` instead of a hand-rolled
//! string-keyed map. Unlike the original (whose own source comments admit
//! its TOML reader cannot parse array-of-tables), `[[lrs]]` here is a real
//! `Vec<LayerConfig>` deserialized by `toml` directly.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::DownloadError;

fn default_workers() -> usize {
    4
}

fn default_tm_min() -> u32 {
    0
}

fn default_tm_max() -> u32 {
    20
}

fn default_tm_format() -> String {
    "jpg".to_string()
}

fn default_tm_schema() -> String {
    "xyz".to_string()
}

fn default_output_format() -> String {
    "mbtiles".to_string()
}

fn default_output_directory() -> String {
    "output".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enable: false,
            file: None,
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_format")]
    pub format: String,
    #[serde(default = "default_output_directory")]
    pub directory: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
            directory: default_output_directory(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub timedelay: u64,
    #[serde(default)]
    pub skipexisting: bool,
    #[serde(default)]
    pub resume: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timedelay: 0,
            skipexisting: false,
            resume: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TileMapConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_tm_min")]
    pub min: u32,
    #[serde(default = "default_tm_max")]
    pub max: u32,
    #[serde(default = "default_tm_format")]
    pub format: String,
    #[serde(default = "default_tm_schema")]
    pub schema: String,
    #[serde(default)]
    pub json: Option<String>,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LayerConfig {
    #[serde(default)]
    pub min: Option<u32>,
    #[serde(default)]
    pub max: Option<u32>,
    #[serde(default)]
    pub geojson: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Top-level settings tree, parsed once from a TOML file and passed by
/// reference/`Arc` into the coordinator. Replaces the original's process-wide
/// mutable `Config` singleton (see `SPEC_FULL.md` §9 REDESIGN note).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub tm: TileMapConfig,
    #[serde(default)]
    pub lrs: Vec<LayerConfig>,
}

impl Settings {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, DownloadError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| DownloadError::ConfigRead {
                path: path.clone(),
                source,
            })?;
        toml::from_str(&text).map_err(|source| DownloadError::ConfigParse { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_config_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.output.format, "mbtiles");
        assert_eq!(settings.output.directory, "output");
        assert_eq!(settings.task.workers, 4);
        assert_eq!(settings.task.timedelay, 0);
        assert!(!settings.task.skipexisting);
        assert!(!settings.task.resume);
        assert_eq!(settings.tm.min, 0);
        assert_eq!(settings.tm.max, 20);
        assert_eq!(settings.tm.format, "jpg");
        assert_eq!(settings.tm.schema, "xyz");
        assert!(settings.lrs.is_empty());
    }

    #[test]
    fn parses_lrs_array_of_tables() {
        let toml_text = r#"
            [tm]
            url = "http://h/{z}/{x}/{y}.png"

            [[lrs]]
            min = 0
            max = 2

            [[lrs]]
            min = 3
            max = 5
            geojson = "mask.geojson"
        "#;
        let settings: Settings = toml::from_str(toml_text).unwrap();
        assert_eq!(settings.lrs.len(), 2);
        assert_eq!(settings.lrs[0].max, Some(2));
        assert_eq!(settings.lrs[1].geojson.as_deref(), Some("mask.geojson"));
    }
}
