//! In-memory FIFO of samples for one track.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::pool::SamplePool;
use crate::sample::Sample;

/// FIFO window of samples waiting to be consumed.
///
/// Samples are deep-copied into pooled buffers on the way in and copied out
/// (then recycled) on the way out, so no buffer is ever shared with the
/// caller.
#[derive(Debug)]
pub struct SampleQueue {
    pool: Arc<SamplePool>,
    samples: VecDeque<Sample>,
}

impl SampleQueue {
    pub fn new(pool: Arc<SamplePool>) -> Self {
        Self {
            pool,
            samples: VecDeque::new(),
        }
    }

    /// Append a copy of `sample`.
    pub fn queue_sample(&mut self, sample: &Sample) {
        let mut copy = self.pool.acquire(sample.size());
        copy.copy_from(sample);
        self.samples.push_back(copy);
    }

    /// Copy the oldest sample into `holder`. Returns false when empty.
    pub fn dequeue_sample(&mut self, holder: &mut Sample) -> bool {
        match self.samples.pop_front() {
            Some(sample) => {
                holder.copy_from(&sample);
                self.pool.release(sample);
                true
            }
            None => false,
        }
    }

    /// Timestamp of the newest queued sample.
    pub fn end_position_us(&self) -> Option<i64> {
        self.samples.back().map(|s| s.time_us)
    }

    /// Whether the queued samples span more than `threshold_us`.
    pub fn is_duration_greater_than(&self, threshold_us: i64) -> bool {
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => last.time_us - first.time_us > threshold_us,
            _ => false,
        }
    }

    /// Release every queued sample back to the pool.
    pub fn clear(&mut self) {
        for sample in self.samples.drain(..) {
            self.pool.release(sample);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Drop for SampleQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SAMPLE_FLAG_SYNC;

    #[test]
    fn test_fifo_order_and_copy() {
        let pool = Arc::new(SamplePool::new());
        let mut queue = SampleQueue::new(Arc::clone(&pool));

        let mut input = Sample::new(100, SAMPLE_FLAG_SYNC, vec![1, 2, 3]);
        queue.queue_sample(&input);
        input.data[0] = 9;
        queue.queue_sample(&Sample::new(200, 0, vec![4]));

        let mut holder = Sample::default();
        assert!(queue.dequeue_sample(&mut holder));
        assert_eq!(holder, Sample::new(100, SAMPLE_FLAG_SYNC, vec![1, 2, 3]));
        assert!(queue.dequeue_sample(&mut holder));
        assert_eq!(holder.time_us, 200);
        assert!(!queue.dequeue_sample(&mut holder));

        // Both buffers were handed back.
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_end_position_and_duration() {
        let pool = Arc::new(SamplePool::new());
        let mut queue = SampleQueue::new(pool);
        assert_eq!(queue.end_position_us(), None);
        assert!(!queue.is_duration_greater_than(0));

        queue.queue_sample(&Sample::new(1_000, 0, vec![0]));
        queue.queue_sample(&Sample::new(501_000, 0, vec![0]));
        assert_eq!(queue.end_position_us(), Some(501_000));
        assert!(queue.is_duration_greater_than(499_999));
        assert!(!queue.is_duration_greater_than(500_000));
    }

    #[test]
    fn test_clear_releases_to_pool() {
        let pool = Arc::new(SamplePool::new());
        let mut queue = SampleQueue::new(Arc::clone(&pool));
        for i in 0..4 {
            queue.queue_sample(&Sample::new(i, 0, vec![0; 8]));
        }
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(pool.len(), 4);
    }
}
