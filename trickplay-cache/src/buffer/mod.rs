//! The sample buffer consumed by the media pipeline.
//!
//! One interface, two variants picked at construction:
//! - [`DiskSampleBuffer`]: segment-file backed, used for trickplay,
//!   recording and recorded playback
//! - [`MemorySampleBuffer`]: per-track queues only, used for plain live
//!   playback when no usable disk cache exists
//!
//! The producer (demuxer) and consumer (decoder) call the buffer from their
//! own threads; every method takes `&self`.

mod cursor;
mod disk;
mod memory;

use std::sync::Arc;

pub use disk::DiskSampleBuffer;
pub use memory::MemorySampleBuffer;

use crate::cache::CacheManager;
use crate::error::CacheError;
use crate::sample::{Sample, TrackFormat};

/// What the buffer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Live viewing, with trickplay when a disk cache is available.
    Live,
    /// Live viewing while recording to persistent storage.
    Record,
    /// Playback of a finished recording.
    RecordedPlayback,
}

/// Outcome of a non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    SampleRead,
    /// Nothing available yet; poll again later.
    NothingRead,
    EndOfStream,
}

/// How far the buffer can serve without waiting on the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferedPosition {
    Unknown,
    EndOfSource,
    At(i64),
}

impl BufferedPosition {
    /// The lesser of two horizons. `Unknown` dominates, `EndOfSource` is
    /// the greatest.
    pub fn min(self, other: BufferedPosition) -> BufferedPosition {
        use BufferedPosition::*;
        match (self, other) {
            (Unknown, _) | (_, Unknown) => Unknown,
            (EndOfSource, p) | (p, EndOfSource) => p,
            (At(a), At(b)) => At(a.min(b)),
        }
    }
}

/// Pipeline-facing notifications. Every method defaults to a no-op.
pub trait BufferListener: Send + Sync {
    /// Eviction moved the oldest cached position; `start_time_ms` is the
    /// creation time of the evicted segment.
    fn on_cache_start_time_changed(&self, _start_time_ms: i64) {}

    /// Whether trickplay is available for this buffer.
    fn on_cache_state_changed(&self, _available: bool) {}

    /// The disk is too slow; disk-backed caching has been turned off.
    fn on_disk_too_slow(&self) {}
}

/// Sample buffer handed to the media pipeline.
pub enum SampleBuffer {
    Disk(DiskSampleBuffer),
    Memory(MemorySampleBuffer),
}

macro_rules! dispatch {
    ($self:ident, $buffer:ident => $call:expr) => {
        match $self {
            SampleBuffer::Disk($buffer) => $call,
            SampleBuffer::Memory($buffer) => $call,
        }
    };
}

impl SampleBuffer {
    /// Pick the variant for `mode`.
    ///
    /// Live mode falls back to memory when there is no cache manager or the
    /// manager was disabled for a slow disk. Recording and recorded playback
    /// need a cache manager.
    pub fn new(
        mode: BufferMode,
        cache: Option<Arc<CacheManager>>,
        listener: Option<Arc<dyn BufferListener>>,
    ) -> Result<Self, CacheError> {
        match (mode, cache) {
            (BufferMode::Live, None) => Ok(SampleBuffer::Memory(MemorySampleBuffer::new(listener))),
            (BufferMode::Live, Some(cache)) if cache.is_disabled() => {
                Ok(SampleBuffer::Memory(MemorySampleBuffer::new(listener)))
            }
            (mode, Some(cache)) => Ok(SampleBuffer::Disk(DiskSampleBuffer::new(mode, cache, listener))),
            (mode, None) => Err(CacheError::InvalidState(format!(
                "{:?} mode requires a cache manager",
                mode
            ))),
        }
    }

    pub fn is_disk_backed(&self) -> bool {
        matches!(self, SampleBuffer::Disk(_))
    }

    /// Declare the tracks of the program.
    pub fn init(&self, tracks: &[TrackFormat]) -> Result<(), CacheError> {
        dispatch!(self, b => b.init(tracks))
    }

    /// Formats passed to [`SampleBuffer::init`].
    pub fn track_formats(&self) -> Vec<TrackFormat> {
        dispatch!(self, b => b.track_formats())
    }

    pub fn select_track(&self, index: usize) -> Result<(), CacheError> {
        dispatch!(self, b => b.select_track(index))
    }

    pub fn deselect_track(&self, index: usize) -> Result<(), CacheError> {
        dispatch!(self, b => b.deselect_track(index))
    }

    /// Append a sample from the producer. May block on disk backpressure.
    pub fn write_sample(&self, index: usize, sample: &Sample) -> Result<(), CacheError> {
        dispatch!(self, b => b.write_sample(index, sample))
    }

    /// Copy the next sample of track `index` into `holder`. Never blocks.
    pub fn read_sample(&self, index: usize, holder: &mut Sample) -> Result<ReadResult, CacheError> {
        dispatch!(self, b => b.read_sample(index, holder))
    }

    pub fn seek_to(&self, position_us: i64) {
        dispatch!(self, b => b.seek_to(position_us))
    }

    /// Smallest buffered horizon across the selected tracks.
    pub fn buffered_position(&self) -> BufferedPosition {
        dispatch!(self, b => b.buffered_position())
    }

    /// Advance buffering to `position_us`. Returns true when every selected
    /// track has something to read or has ended.
    pub fn continue_buffering(&self, position_us: i64) -> bool {
        dispatch!(self, b => b.continue_buffering(position_us))
    }

    /// The producer is done; readers see end of stream after the last sample.
    pub fn set_eos(&self) {
        dispatch!(self, b => b.set_eos())
    }

    pub fn release(&self) {
        dispatch!(self, b => b.release())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::storage::{TrickplayStorageConfig, TrickplayStorageManager};
    use std::path::Path;

    fn cache(dir: &Path) -> Arc<CacheManager> {
        let storage = Arc::new(TrickplayStorageManager::with_free_space(
            dir,
            TrickplayStorageConfig::default(),
            Arc::new(|_: &Path| Some(1u64 << 40)),
        ));
        CacheManager::new(storage, CacheConfig::default()).unwrap()
    }

    #[test]
    fn test_buffered_position_min() {
        use BufferedPosition::*;
        assert_eq!(At(5).min(At(3)), At(3));
        assert_eq!(EndOfSource.min(At(3)), At(3));
        assert_eq!(EndOfSource.min(EndOfSource), EndOfSource);
        assert_eq!(Unknown.min(At(3)), Unknown);
    }

    #[test]
    fn test_construction_policy() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(dir.path());

        assert!(!SampleBuffer::new(BufferMode::Live, None, None).unwrap().is_disk_backed());
        assert!(SampleBuffer::new(BufferMode::Live, Some(Arc::clone(&cache)), None)
            .unwrap()
            .is_disk_backed());
        assert!(SampleBuffer::new(BufferMode::Record, None, None).is_err());
        assert!(SampleBuffer::new(BufferMode::RecordedPlayback, None, None).is_err());

        cache.disable();
        assert!(!SampleBuffer::new(BufferMode::Live, Some(Arc::clone(&cache)), None)
            .unwrap()
            .is_disk_backed());
        assert!(SampleBuffer::new(BufferMode::Record, Some(cache), None)
            .unwrap()
            .is_disk_backed());
    }
}
