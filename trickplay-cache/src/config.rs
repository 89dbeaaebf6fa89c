//! Tunables for the cache and the sample buffers.

use std::time::Duration;

use serde::Deserialize;

/// Default length of one segment in microseconds.
pub const DEFAULT_CHUNK_DURATION_US: i64 = 500_000;

/// Default distance from the live edge within which a seek attaches to the
/// segment being written.
pub const DEFAULT_LIVE_THRESHOLD_US: i64 = 1_000_000;

/// Default read-ahead horizon of a track cursor.
pub const DEFAULT_READ_AHEAD_US: i64 = 1_000_000;

/// Default soft timeout for a blocking segment write.
pub const DEFAULT_WRITE_SOFT_TIMEOUT_MS: u64 = 1_000;

/// Default number of samples a segment reads ahead of its consumer.
pub const DEFAULT_SEGMENT_READ_AHEAD: usize = 3;

/// Cache configuration.
///
/// Every field has a default, so a partial `[cache]` TOML table is valid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Segment length; new segments start on multiples of this value.
    pub chunk_duration_us: i64,
    /// Seeks this close to the live edge attach to the write segment.
    pub live_threshold_us: i64,
    /// How much media a track cursor buffers ahead in its queue.
    pub read_ahead_us: i64,
    /// Time a writer waits before logging a stalled write.
    pub write_soft_timeout_ms: u64,
    /// Samples held by a segment reader before it pauses.
    pub segment_read_ahead: usize,
}

impl CacheConfig {
    pub fn write_soft_timeout(&self) -> Duration {
        Duration::from_millis(self.write_soft_timeout_ms)
    }

    /// Start of the chunk containing `time_us`.
    pub fn chunk_start(&self, time_us: i64) -> i64 {
        time_us.div_euclid(self.chunk_duration_us) * self.chunk_duration_us
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_duration_us: DEFAULT_CHUNK_DURATION_US,
            live_threshold_us: DEFAULT_LIVE_THRESHOLD_US,
            read_ahead_us: DEFAULT_READ_AHEAD_US,
            write_soft_timeout_ms: DEFAULT_WRITE_SOFT_TIMEOUT_MS,
            segment_read_ahead: DEFAULT_SEGMENT_READ_AHEAD,
        }
    }
}
