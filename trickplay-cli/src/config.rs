//! `trickplay.toml` configuration file.
//!
//! ```toml
//! [cache]
//! chunk_duration_us = 500000
//!
//! [storage]
//! dir = "/var/cache/trickplay"
//! max_cache_bytes = 1073741824
//!
//! [logging]
//! log_dir = "logs"
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use trickplay_cache::{CacheConfig, RecordingStorageConfig, TrickplayStorageConfig};

/// File searched in the working directory when `-f` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "trickplay.toml";

#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct StorageSection {
    pub dir: Option<String>,
    pub max_cache_bytes: Option<u64>,
    pub max_free_space_fraction: Option<f64>,
    pub reserved_free_bytes: Option<u64>,
}

impl StorageSection {
    pub fn trickplay(&self) -> TrickplayStorageConfig {
        let defaults = TrickplayStorageConfig::default();
        TrickplayStorageConfig {
            max_cache_bytes: self.max_cache_bytes.unwrap_or(defaults.max_cache_bytes),
            max_free_space_fraction: self
                .max_free_space_fraction
                .unwrap_or(defaults.max_free_space_fraction),
            reserved_free_bytes: self.reserved_free_bytes.unwrap_or(defaults.reserved_free_bytes),
        }
    }

    pub fn recording(&self) -> RecordingStorageConfig {
        let defaults = RecordingStorageConfig::default();
        RecordingStorageConfig {
            reserved_free_bytes: self.reserved_free_bytes.unwrap_or(defaults.reserved_free_bytes),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

pub fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Explicit path, else `trickplay.toml` if present.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_file() {
        let config: ConfigFile = toml::from_str(
            r#"
            [cache]
            chunk_duration_us = 1000000

            [storage]
            max_cache_bytes = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.chunk_duration_us, 1_000_000);
        assert_eq!(config.cache.live_threshold_us, CacheConfig::default().live_threshold_us);
        let trickplay = config.storage.trickplay();
        assert_eq!(trickplay.max_cache_bytes, 1024);
        assert_eq!(trickplay.max_free_space_fraction, 0.5);
        assert!(config.logging.log_dir.is_none());
    }

    #[test]
    fn test_empty_file() {
        let config: ConfigFile = toml::from_str("").unwrap();
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.storage.recording(), RecordingStorageConfig::default());
    }
}
