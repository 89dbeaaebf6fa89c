//! Ephemeral, size-bounded storage for the live trickplay buffer.

use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::Deserialize;

use super::{remove_dir_contents, system_free_space, FreeSpaceFn, StorageManager, DEFAULT_RESERVED_FREE_BYTES};

/// Default hard cap on the trickplay cache.
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Default share of the free space the cache may occupy.
pub const DEFAULT_MAX_FREE_SPACE_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrickplayStorageConfig {
    /// Absolute upper bound on cached bytes.
    pub max_cache_bytes: u64,
    /// Share of the free space measured at startup the cache may use.
    pub max_free_space_fraction: f64,
    /// Free space that must remain on the disk.
    pub reserved_free_bytes: u64,
}

impl Default for TrickplayStorageConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            max_free_space_fraction: DEFAULT_MAX_FREE_SPACE_FRACTION,
            reserved_free_bytes: DEFAULT_RESERVED_FREE_BYTES,
        }
    }
}

/// Trickplay storage.
///
/// The size cap is fixed when the manager is created: the smaller of
/// `max_cache_bytes` and `max_free_space_fraction` of the free space at that
/// moment. Files never outlive the session.
pub struct TrickplayStorageManager {
    dir: PathBuf,
    config: TrickplayStorageConfig,
    max_bytes: u64,
    free_space: FreeSpaceFn,
}

impl TrickplayStorageManager {
    pub fn new(dir: impl Into<PathBuf>, config: TrickplayStorageConfig) -> Self {
        Self::with_free_space(dir, config, system_free_space())
    }

    /// Create with a custom free-space probe.
    pub fn with_free_space(
        dir: impl Into<PathBuf>,
        config: TrickplayStorageConfig,
        free_space: FreeSpaceFn,
    ) -> Self {
        let dir = dir.into();
        let fraction = config.max_free_space_fraction.clamp(0.0, 1.0);
        let max_bytes = match free_space(&dir).or_else(|| dir.parent().and_then(|p| free_space(p))) {
            Some(free) => config.max_cache_bytes.min((free as f64 * fraction) as u64),
            None => {
                warn!("[TrickplayStorage] free space unknown, using configured maximum");
                config.max_cache_bytes
            }
        };
        info!("[TrickplayStorage] {:?}, max {} bytes", dir, max_bytes);

        Self {
            dir,
            config,
            max_bytes,
            free_space,
        }
    }

    /// Effective size cap in bytes.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

impl StorageManager for TrickplayStorageManager {
    fn cache_dir(&self) -> &Path {
        &self.dir
    }

    fn clear_storage(&self) -> io::Result<()> {
        remove_dir_contents(&self.dir)
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn reached_storage_max(&self, cache_size: u64, pending_delete: u64) -> bool {
        cache_size.saturating_sub(pending_delete) > self.max_bytes
    }

    fn has_enough_buffer(&self, pending_delete: u64) -> bool {
        match (self.free_space)(&self.dir) {
            Some(free) => free.saturating_add(pending_delete) >= self.config.reserved_free_bytes,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const MB: u64 = 1024 * 1024;

    fn manager(free: Arc<AtomicU64>, config: TrickplayStorageConfig) -> TrickplayStorageManager {
        TrickplayStorageManager::with_free_space(
            "/tmp/trickplay",
            config,
            Arc::new(move |_: &Path| Some(free.load(Ordering::SeqCst))),
        )
    }

    #[test]
    fn test_max_is_fraction_of_free_space() {
        let free = Arc::new(AtomicU64::new(1000 * MB));
        let storage = manager(free, TrickplayStorageConfig::default());
        assert_eq!(storage.max_bytes(), 500 * MB);
        assert!(!storage.is_persistent());
        assert!(!storage.reached_storage_max(500 * MB, 0));
        assert!(storage.reached_storage_max(500 * MB + 1, 0));
        assert!(!storage.reached_storage_max(600 * MB, 100 * MB));
    }

    #[test]
    fn test_max_is_capped_by_config() {
        let free = Arc::new(AtomicU64::new(1000 * 1024 * MB));
        let config = TrickplayStorageConfig {
            max_cache_bytes: 64 * MB,
            ..Default::default()
        };
        assert_eq!(manager(free, config).max_bytes(), 64 * MB);
    }

    #[test]
    fn test_reserve_counts_pending_deletes() {
        let free = Arc::new(AtomicU64::new(1000 * MB));
        let storage = manager(Arc::clone(&free), TrickplayStorageConfig::default());
        assert!(storage.has_enough_buffer(0));

        free.store(60 * MB, Ordering::SeqCst);
        assert!(!storage.has_enough_buffer(0));
        assert!(storage.has_enough_buffer(40 * MB));
    }

    #[test]
    fn test_clear_storage_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("v_0.cache"), b"stale").unwrap();
        let storage = TrickplayStorageManager::new(dir.path(), TrickplayStorageConfig::default());
        storage.clear_storage().unwrap();
        assert!(!dir.path().join("v_0.cache").exists());
    }
}
