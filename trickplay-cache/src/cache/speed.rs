//! Write-throughput instrumentation used to detect a slow backing store.

use std::time::Duration;

/// Writes smaller than this are ignored; their timing is mostly noise.
pub const MIN_WRITE_SIZE_FOR_SPEED_CHECK: u64 = 10 * 1024;

/// Bytes that must accumulate before a speed check is made.
pub const MIN_TOTAL_SIZE_FOR_SPEED_CHECK: u64 = 10 * 1024 * 1024;

/// Number of checks after which the gate freezes at "not slow".
pub const MAX_SPEED_CHECK_COUNT: u32 = 10;

/// Throughput floor in MB/s.
pub const MIN_WRITE_SPEED_MBPS: f64 = 3.0;

/// Accumulates qualifying write timings and periodically compares the
/// observed throughput against [`MIN_WRITE_SPEED_MBPS`].
#[derive(Debug, Default, Clone)]
pub struct DiskSpeedGate {
    total_size: u64,
    total_time_ns: u128,
    check_count: u32,
}

impl DiskSpeedGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed write.
    pub fn record_write(&mut self, size: u64, elapsed: Duration) {
        if self.check_count >= MAX_SPEED_CHECK_COUNT || size <= MIN_WRITE_SIZE_FOR_SPEED_CHECK {
            return;
        }
        self.total_size += size;
        self.total_time_ns += elapsed.as_nanos();
    }

    /// Evaluate the accumulated writes; true means slower than the floor.
    ///
    /// Returns false until enough data has accumulated. Each evaluation
    /// consumes one check and resets the accumulators; after
    /// [`MAX_SPEED_CHECK_COUNT`] checks this always returns false.
    pub fn check_write_speed(&mut self) -> bool {
        if self.check_count >= MAX_SPEED_CHECK_COUNT
            || self.total_size < MIN_TOTAL_SIZE_FOR_SPEED_CHECK
        {
            return false;
        }
        self.check_count += 1;

        let seconds = self.total_time_ns as f64 / 1_000_000_000.0;
        let megabytes = self.total_size as f64 / (1024.0 * 1024.0);
        self.total_size = 0;
        self.total_time_ns = 0;

        if seconds <= 0.0 {
            return false;
        }
        megabytes / seconds < MIN_WRITE_SPEED_MBPS
    }

    /// Number of checks performed so far.
    pub fn check_count(&self) -> u32 {
        self.check_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn feed(gate: &mut DiskSpeedGate, total: u64, mbps: f64) {
        let chunk = MB;
        let per_chunk = Duration::from_secs_f64(1.0 / mbps);
        let mut written = 0;
        while written < total {
            gate.record_write(chunk, per_chunk);
            written += chunk;
        }
    }

    #[test]
    fn test_not_slow_below_threshold() {
        let mut gate = DiskSpeedGate::new();
        feed(&mut gate, 5 * MB, 0.5);
        assert!(!gate.check_write_speed());
        assert_eq!(gate.check_count(), 0);
    }

    #[test]
    fn test_small_writes_are_ignored() {
        let mut gate = DiskSpeedGate::new();
        for _ in 0..10_000 {
            gate.record_write(MIN_WRITE_SIZE_FOR_SPEED_CHECK, Duration::from_secs(1));
        }
        assert!(!gate.check_write_speed());
    }

    #[test]
    fn test_detects_slow_and_fast() {
        let mut gate = DiskSpeedGate::new();
        feed(&mut gate, 10 * MB, 1.0);
        assert!(gate.check_write_speed());

        feed(&mut gate, 10 * MB, 50.0);
        assert!(!gate.check_write_speed());
        assert_eq!(gate.check_count(), 2);
    }

    #[test]
    fn test_freezes_after_max_checks() {
        let mut gate = DiskSpeedGate::new();
        for _ in 0..MAX_SPEED_CHECK_COUNT {
            feed(&mut gate, 10 * MB, 50.0);
            assert!(!gate.check_write_speed());
        }
        feed(&mut gate, 10 * MB, 0.1);
        assert!(!gate.check_write_speed());
        assert_eq!(gate.check_count(), MAX_SPEED_CHECK_COUNT);
    }
}
