//! Byte accounting shared between the cache manager and its segments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::speed::DiskSpeedGate;
use crate::segment::SegmentKey;

/// Counters updated from segment write and delete callbacks.
///
/// `cache_size` always equals the summed size of live segment files.
#[derive(Debug, Default)]
pub struct CacheAccounting {
    cache_size: AtomicU64,
    pending_delete: Mutex<HashMap<SegmentKey, u64>>,
    speed: Mutex<DiskSpeedGate>,
}

impl CacheAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held by live segments.
    pub fn cache_size(&self) -> u64 {
        self.cache_size.load(Ordering::SeqCst)
    }

    /// Bytes of segments chosen for eviction but not yet removed.
    pub fn pending_delete_size(&self) -> u64 {
        self.pending_delete.lock().values().sum()
    }

    pub fn is_pending_delete(&self, key: &SegmentKey) -> bool {
        self.pending_delete.lock().contains_key(key)
    }

    pub(crate) fn on_write(&self, size: u64, elapsed: Duration) {
        self.cache_size.fetch_add(size, Ordering::SeqCst);
        self.speed.lock().record_write(size, elapsed);
    }

    /// Account for an existing file adopted from storage.
    pub(crate) fn on_adopt(&self, size: u64) {
        self.cache_size.fetch_add(size, Ordering::SeqCst);
    }

    pub(crate) fn mark_pending_delete(&self, key: SegmentKey, size: u64) {
        self.pending_delete.lock().insert(key, size);
    }

    pub(crate) fn on_delete(&self, key: &SegmentKey, size: u64) {
        self.pending_delete.lock().remove(key);
        // Saturate so a double report can never wrap the counter.
        let _ = self
            .cache_size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(size))
            });
    }

    pub(crate) fn check_write_speed(&self) -> bool {
        self.speed.lock().check_write_speed()
    }

    pub(crate) fn clear_pending_delete(&self, key: &SegmentKey) {
        self.pending_delete.lock().remove(key);
    }

    /// Feed write timings to the speed gate without touching the size.
    #[cfg(test)]
    pub(crate) fn record_write_timing(&self, size: u64, elapsed: Duration) {
        self.speed.lock().record_write(size, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_tracking() {
        let accounting = CacheAccounting::new();
        let key = SegmentKey::new("v", 0);

        accounting.on_write(100, Duration::from_millis(1));
        accounting.on_write(50, Duration::from_millis(1));
        assert_eq!(accounting.cache_size(), 150);

        accounting.mark_pending_delete(key.clone(), 150);
        assert_eq!(accounting.pending_delete_size(), 150);
        assert!(accounting.is_pending_delete(&key));

        accounting.on_delete(&key, 150);
        assert_eq!(accounting.cache_size(), 0);
        assert_eq!(accounting.pending_delete_size(), 0);
    }
}
