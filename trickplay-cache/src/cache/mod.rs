//! Per-track segment chains, eviction and disk-speed monitoring.
//!
//! This module provides:
//! - [`CacheManager`]: owns every track's ordered segment map and the I/O worker
//! - [`CacheAccounting`]: byte counters fed by segment callbacks
//! - [`DiskSpeedGate`]: write-throughput check that can disable the cache
//! - [`EvictionListener`]: per-track notification of evicted segments

pub mod accounting;
pub mod speed;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;

pub use accounting::CacheAccounting;
pub use speed::DiskSpeedGate;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::io_worker::IoWorker;
use crate::pool::SamplePool;
use crate::sample::Sample;
use crate::segment::{Segment, SegmentEnv, SegmentKey, SegmentRead};
use crate::storage::StorageManager;

/// Receives a callback when one of a track's segments is evicted.
pub trait EvictionListener: Send + Sync {
    /// `created_ms` is the wall-clock creation time of the evicted segment.
    fn on_cache_evicted(&self, track_id: &str, created_ms: i64);
}

/// Segments of one track, keyed by start position.
#[derive(Default)]
struct TrackCache {
    segments: BTreeMap<i64, Arc<Segment>>,
    active_write: Option<i64>,
    loaded_from_storage: bool,
}

impl TrackCache {
    fn active_segment(&self) -> Option<&Arc<Segment>> {
        self.active_write.and_then(|start| self.segments.get(&start))
    }

    /// Drop leading segments that disposed themselves after an I/O error.
    /// Their bytes are already out of the cache size.
    fn prune_deleted_heads(&mut self) -> usize {
        let mut pruned = 0;
        while let Some((&start, segment)) = self.segments.iter().next() {
            if self.active_write == Some(start) || !segment.is_deleted() {
                break;
            }
            self.segments.remove(&start);
            pruned += 1;
        }
        pruned
    }
}

/// Owner of all cached segments for one session.
///
/// Every segment file operation runs on a single worker thread owned by the
/// manager; segment maps and counters are guarded by coarse locks.
pub struct CacheManager {
    storage: Arc<dyn StorageManager>,
    config: CacheConfig,
    worker: IoWorker,
    env: SegmentEnv,
    tracks: Mutex<HashMap<String, TrackCache>>,
    listeners: Mutex<HashMap<String, Arc<dyn EvictionListener>>>,
    disabled: AtomicBool,
    closing: AtomicBool,
}

impl CacheManager {
    /// Create a manager over `storage`.
    ///
    /// The cache directory is created if missing; failure to do so is the
    /// one I/O error that propagates. Ephemeral storage is wiped so stale
    /// segments from a previous session do not count against the quota.
    pub fn new(storage: Arc<dyn StorageManager>, config: CacheConfig) -> Result<Arc<Self>, CacheError> {
        fs::create_dir_all(storage.cache_dir())?;
        if !storage.is_persistent() {
            if let Err(e) = storage.clear_storage() {
                warn!("[CacheManager] failed to clear {:?}: {}", storage.cache_dir(), e);
            }
        }

        let worker = IoWorker::new("trickplay-cache-io")?;
        let env = SegmentEnv {
            pool: Arc::new(SamplePool::new()),
            accounting: Arc::new(CacheAccounting::new()),
            read_ahead: config.segment_read_ahead.max(1),
            persistent: storage.is_persistent(),
        };
        info!(
            "[CacheManager] opened {:?} (persistent: {})",
            storage.cache_dir(),
            storage.is_persistent()
        );

        Ok(Arc::new(Self {
            storage,
            config,
            worker,
            env,
            tracks: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            disabled: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        }))
    }

    pub fn storage(&self) -> &Arc<dyn StorageManager> {
        &self.storage
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Buffer pool shared by every segment and queue of this session.
    pub fn pool(&self) -> &Arc<SamplePool> {
        &self.env.pool
    }

    pub fn is_persistent(&self) -> bool {
        self.env.persistent
    }

    /// Total bytes in live segments.
    pub fn cache_size(&self) -> u64 {
        self.env.accounting.cache_size()
    }

    /// Bytes chosen for eviction that are still on disk.
    pub fn pending_delete_size(&self) -> u64 {
        self.env.accounting.pending_delete_size()
    }

    // ---------------------------------------------------------------------
    // Segment creation and lookup
    // ---------------------------------------------------------------------

    /// Open a new write segment for `track_id` starting at `position_us`.
    ///
    /// The track's previous write segment, if any, is finalized; its
    /// successor is this segment. Fails with `OutOfStorage` when eviction
    /// cannot make room on a persistent backend.
    pub fn create_new_write_file(
        &self,
        track_id: &str,
        position_us: i64,
    ) -> Result<Arc<Segment>, CacheError> {
        self.maybe_evict_cache();
        if self.storage.is_persistent() && self.is_over_quota() {
            warn!(
                "[CacheManager] out of storage for {} at {}us",
                track_id, position_us
            );
            return Err(CacheError::OutOfStorage {
                track_id: track_id.to_string(),
                position_us,
            });
        }

        let mut tracks = self.tracks.lock();
        let track = tracks.entry(track_id.to_string()).or_default();
        if track.loaded_from_storage {
            return Err(CacheError::TrackAlreadyLoaded(track_id.to_string()));
        }
        if track.segments.contains_key(&position_us) {
            return Err(CacheError::InvalidState(format!(
                "segment {}@{}us already exists",
                track_id, position_us
            )));
        }

        let segment = Segment::create(
            SegmentKey::new(track_id, position_us),
            self.storage.cache_dir(),
            self.env.clone(),
        );
        track.segments.insert(position_us, Arc::clone(&segment));
        if let Some(previous) = track.active_segment() {
            previous.finish_write(&self.worker);
        }
        track.active_write = Some(position_us);
        debug!("[CacheManager] new write segment {}@{}us", track_id, position_us);
        Ok(segment)
    }

    /// Rebuild a track's segment chain from its persisted index.
    ///
    /// Every segment is adopted read-only. A track can be loaded or written,
    /// never both, within one manager.
    pub fn load_track_from_storage(&self, track_id: &str) -> Result<(), CacheError> {
        let starts = self.storage.read_index(track_id)?;

        let mut tracks = self.tracks.lock();
        let track = tracks.entry(track_id.to_string()).or_default();
        if track.loaded_from_storage || !track.segments.is_empty() {
            return Err(CacheError::TrackAlreadyLoaded(track_id.to_string()));
        }
        track.loaded_from_storage = true;

        for start in starts {
            match Segment::from_file(
                SegmentKey::new(track_id, start),
                self.storage.cache_dir(),
                self.env.clone(),
            ) {
                Ok(segment) => {
                    track.segments.insert(start, segment);
                }
                Err(e) => warn!(
                    "[CacheManager] missing segment {}@{}us: {}",
                    track_id, start, e
                ),
            }
        }
        info!(
            "[CacheManager] loaded {} segments for track {}",
            track.segments.len(),
            track_id
        );
        Ok(())
    }

    /// Segment whose range contains `position_us`.
    ///
    /// Floor lookup: the greatest start at or before the position, or the
    /// earliest segment when the position precedes all data.
    pub fn get_read_file(&self, track_id: &str, position_us: i64) -> Option<Arc<Segment>> {
        let tracks = self.tracks.lock();
        let track = tracks.get(track_id)?;
        track
            .segments
            .range(..=position_us)
            .next_back()
            .or_else(|| track.segments.iter().next())
            .map(|(_, segment)| Arc::clone(segment))
    }

    /// Segment following `segment` in its track.
    ///
    /// Derived from the ordered map, so it stays correct if `segment` itself
    /// has already been evicted.
    pub fn next_segment(&self, segment: &Segment) -> Option<Arc<Segment>> {
        let tracks = self.tracks.lock();
        let track = tracks.get(&segment.key().track_id)?;
        track
            .segments
            .range((Bound::Excluded(segment.start_us()), Bound::Unbounded))
            .next()
            .map(|(_, segment)| Arc::clone(segment))
    }

    /// The segment currently being written for `track_id`.
    pub fn active_write_segment(&self, track_id: &str) -> Option<Arc<Segment>> {
        let tracks = self.tracks.lock();
        tracks.get(track_id)?.active_segment().cloned()
    }

    /// Start positions of every segment in `track_id`, ascending.
    pub fn segment_starts(&self, track_id: &str) -> Vec<i64> {
        let tracks = self.tracks.lock();
        tracks
            .get(track_id)
            .map(|t| t.segments.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Start of the earliest retained segment of `track_id`.
    pub fn earliest_start_us(&self, track_id: &str) -> Option<i64> {
        let tracks = self.tracks.lock();
        tracks.get(track_id)?.segments.keys().next().copied()
    }

    // ---------------------------------------------------------------------
    // Segment I/O entry points
    // ---------------------------------------------------------------------

    /// Append `sample` to `segment`, blocking until it is on disk.
    pub fn write_sample(&self, segment: &Arc<Segment>, sample: &Sample) -> Result<(), CacheError> {
        segment.write_sample(&self.worker, sample, self.config.write_soft_timeout())
    }

    /// Finalize the active write segment of `track_id`.
    pub fn finish_write(&self, track_id: &str) {
        let mut tracks = self.tracks.lock();
        if let Some(track) = tracks.get_mut(track_id) {
            if let Some(segment) = track.active_segment() {
                segment.finish_write(&self.worker);
            }
            track.active_write = None;
        }
    }

    /// Non-blocking read from `segment`.
    pub fn read_sample(&self, segment: &Arc<Segment>, holder: &mut Sample) -> SegmentRead {
        segment.read_sample(&self.worker, holder)
    }

    /// Attach a reader at the start of `segment`.
    pub fn start_reading(&self, segment: &Arc<Segment>) {
        segment.start_reading();
    }

    /// Detach the reader of `segment`, allowing a deferred delete.
    pub fn detach_reader(&self, segment: &Arc<Segment>) {
        segment.detach_reader(&self.worker);
    }

    /// Block until every queued I/O task has run.
    pub fn sync(&self) {
        self.worker.call(Duration::from_secs(1), || ());
    }

    // ---------------------------------------------------------------------
    // Eviction
    // ---------------------------------------------------------------------

    fn is_over_quota(&self) -> bool {
        let pending = self.pending_delete_size();
        self.storage.reached_storage_max(self.cache_size(), pending)
            || !self.storage.has_enough_buffer(pending)
    }

    /// Evict head segments until the storage policy is satisfied.
    ///
    /// Only the earliest segment of each track is a candidate; among those,
    /// the one created first goes. Persistent storage is never evicted and
    /// makes this return false whenever the policy is unsatisfied.
    pub fn maybe_evict_cache(&self) -> bool {
        while self.is_over_quota() {
            if self.storage.is_persistent() {
                return false;
            }

            let evicted = {
                let mut tracks = self.tracks.lock();
                for (track_id, track) in tracks.iter_mut() {
                    let pruned = track.prune_deleted_heads();
                    if pruned > 0 {
                        debug!("[CacheManager] dropped {} failed segments of {}", pruned, track_id);
                    }
                }
                let candidate = tracks
                    .iter()
                    .filter(|(_, track)| !track.loaded_from_storage)
                    .filter_map(|(track_id, track)| {
                        let (start, segment) = track.segments.iter().next()?;
                        if track.active_write == Some(*start) {
                            return None;
                        }
                        Some((track_id.clone(), *start, segment.created_ms()))
                    })
                    .min_by_key(|(_, _, created_ms)| *created_ms);

                let (track_id, start, created_ms) = match candidate {
                    Some(c) => c,
                    None => {
                        debug!("[CacheManager] nothing evictable");
                        return false;
                    }
                };
                let segment = tracks
                    .get_mut(&track_id)
                    .and_then(|t| t.segments.remove(&start));
                segment.map(|s| (track_id, created_ms, s))
            };

            if let Some((track_id, created_ms, segment)) = evicted {
                debug!("[CacheManager] evicting {:?}", segment.key());
                self.env
                    .accounting
                    .mark_pending_delete(segment.key().clone(), segment.size());
                segment.request_delete(&self.worker);

                let listener = self.listeners.lock().get(&track_id).cloned();
                if let Some(listener) = listener {
                    listener.on_cache_evicted(&track_id, created_ms);
                }
            }
        }
        true
    }

    pub fn register_eviction_listener(&self, track_id: &str, listener: Arc<dyn EvictionListener>) {
        self.listeners.lock().insert(track_id.to_string(), listener);
    }

    pub fn unregister_eviction_listener(&self, track_id: &str) {
        self.listeners.lock().remove(track_id);
    }

    // ---------------------------------------------------------------------
    // Disk speed
    // ---------------------------------------------------------------------

    /// Run one disk-speed check; true means recent writes ran below the
    /// throughput floor.
    ///
    /// Every call that finds enough accumulated data consumes one of the
    /// gate's limited checks, so only the write path should call this.
    pub fn check_write_speed(&self) -> bool {
        self.env.accounting.check_write_speed()
    }

    /// Permanently stop offering disk-backed buffering.
    pub fn disable(&self) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            warn!("[CacheManager] disk too slow, disk-backed caching disabled");
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn accounting(&self) -> &Arc<CacheAccounting> {
        &self.env.accounting
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Drop every segment of `track_id`.
    ///
    /// Ephemeral files are deleted; persistent files are only closed.
    pub fn clear_track(&self, track_id: &str) {
        let removed = self.tracks.lock().remove(track_id);
        if let Some(track) = removed {
            let remove_files = !self.storage.is_persistent();
            for segment in track.segments.values() {
                segment.close(&self.worker, remove_files);
            }
            debug!(
                "[CacheManager] cleared track {} ({} segments)",
                track_id,
                track.segments.len()
            );
        }
        self.unregister_eviction_listener(track_id);
        self.maybe_shutdown();
    }

    /// Request teardown. The worker stops once every track is cleared.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.maybe_shutdown();
    }

    pub fn is_closed(&self) -> bool {
        !self.worker.is_running()
    }

    fn maybe_shutdown(&self) {
        if self.closing.load(Ordering::SeqCst) && self.tracks.lock().is_empty() {
            // Let queued closes and deletes finish before stopping.
            self.worker.call(Duration::from_secs(1), || ());
            self.worker.shutdown();
            info!("[CacheManager] closed {:?}", self.storage.cache_dir());
        }
    }
}
