//! Disk- and memory-backed sample cache for live TV trickplay, DVR
//! recording and recorded-program playback.
//!
//! The media pipeline talks to a single [`SampleBuffer`]. Behind it, a
//! [`CacheManager`] splits every track into short segment files, serializes
//! all file I/O on one worker thread, evicts the oldest segments when the
//! [`StorageManager`] policy asks for room, and turns disk-backed caching off
//! when the disk cannot keep up.
//!
//! # Segment file format
//!
//! ```text
//! +----------+----------+-------------+------------------+
//! | Size     | Flags    | Timestamp   |     Payload      |
//! | i32 BE   | i32 BE   | i64 BE (us) |    Size bytes    |
//! +----------+----------+-------------+------------------+
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trickplay_cache::{
//!     BufferMode, CacheConfig, CacheManager, MediaFormat, ReadResult, Sample, SampleBuffer,
//!     TrackFormat, TrickplayStorageConfig, TrickplayStorageManager, SAMPLE_FLAG_SYNC,
//! };
//!
//! let storage = Arc::new(TrickplayStorageManager::new(
//!     "/var/cache/trickplay",
//!     TrickplayStorageConfig::default(),
//! ));
//! let cache = CacheManager::new(storage, CacheConfig::default()).unwrap();
//! let buffer = SampleBuffer::new(BufferMode::Live, Some(cache), None).unwrap();
//!
//! buffer
//!     .init(&[TrackFormat::new("video", MediaFormat::video("video/avc", 1920, 1080))])
//!     .unwrap();
//! buffer.select_track(0).unwrap();
//! buffer
//!     .write_sample(0, &Sample::new(0, SAMPLE_FLAG_SYNC, vec![0; 1024]))
//!     .unwrap();
//!
//! let mut holder = Sample::default();
//! while buffer.read_sample(0, &mut holder).unwrap() != ReadResult::SampleRead {}
//! buffer.release();
//! ```

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
mod io_worker;
pub mod pool;
pub mod queue;
pub mod sample;
pub mod segment;
pub mod storage;

pub use buffer::{
    BufferListener, BufferMode, BufferedPosition, DiskSampleBuffer, MemorySampleBuffer,
    ReadResult, SampleBuffer,
};
pub use cache::{CacheAccounting, CacheManager, EvictionListener};
pub use config::CacheConfig;
pub use error::CacheError;
pub use pool::SamplePool;
pub use queue::SampleQueue;
pub use sample::{MediaFormat, Sample, TrackFormat, SAMPLE_FLAG_DECODE_ONLY, SAMPLE_FLAG_SYNC};
pub use segment::{ReadState, Segment, SegmentKey, WriteState};
pub use storage::{
    recording_duration_us, RecordingStorageConfig, RecordingStorageManager, StorageManager,
    TrickplayStorageConfig, TrickplayStorageManager,
};
