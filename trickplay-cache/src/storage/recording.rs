//! Persistent storage for DVR recordings.

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Deserialize;

use super::{remove_dir_contents, system_free_space, FreeSpaceFn, StorageManager, DEFAULT_RESERVED_FREE_BYTES};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecordingStorageConfig {
    /// Free space that must remain on the disk while recording.
    pub reserved_free_bytes: u64,
}

impl Default for RecordingStorageConfig {
    fn default() -> Self {
        Self {
            reserved_free_bytes: DEFAULT_RESERVED_FREE_BYTES,
        }
    }
}

/// Recording storage: no size cap, files kept across sessions, and writes
/// refused once the disk reserve is reached.
pub struct RecordingStorageManager {
    dir: PathBuf,
    config: RecordingStorageConfig,
    free_space: FreeSpaceFn,
}

impl RecordingStorageManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_config(dir, RecordingStorageConfig::default())
    }

    pub fn with_config(dir: impl Into<PathBuf>, config: RecordingStorageConfig) -> Self {
        Self::with_free_space(dir, config, system_free_space())
    }

    /// Create with a custom free-space probe.
    pub fn with_free_space(
        dir: impl Into<PathBuf>,
        config: RecordingStorageConfig,
        free_space: FreeSpaceFn,
    ) -> Self {
        let dir = dir.into();
        debug!("[RecordingStorage] {:?}, reserve {} bytes", dir, config.reserved_free_bytes);
        Self {
            dir,
            config,
            free_space,
        }
    }
}

impl StorageManager for RecordingStorageManager {
    fn cache_dir(&self) -> &Path {
        &self.dir
    }

    fn clear_storage(&self) -> io::Result<()> {
        remove_dir_contents(&self.dir)
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn reached_storage_max(&self, _cache_size: u64, _pending_delete: u64) -> bool {
        false
    }

    fn has_enough_buffer(&self, pending_delete: u64) -> bool {
        match (self.free_space)(&self.dir) {
            Some(free) => free.saturating_add(pending_delete) >= self.config.reserved_free_bytes,
            None => {
                warn!("[RecordingStorage] free space unknown, assuming enough");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_reserve_is_enforced() {
        let free = Arc::new(AtomicU64::new(200 * 1024 * 1024));
        let probe = {
            let free = Arc::clone(&free);
            Arc::new(move |_: &Path| Some(free.load(Ordering::SeqCst)))
        };
        let storage = RecordingStorageManager::with_free_space(
            "/recordings/1",
            RecordingStorageConfig::default(),
            probe,
        );

        assert!(storage.is_persistent());
        assert!(!storage.reached_storage_max(u64::MAX, 0));
        assert!(storage.has_enough_buffer(0));

        free.store(50 * 1024 * 1024, Ordering::SeqCst);
        assert!(!storage.has_enough_buffer(0));
        assert!(storage.has_enough_buffer(50 * 1024 * 1024));
    }
}
