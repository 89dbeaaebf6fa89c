//! Pool of reusable sample buffers.

use parking_lot::Mutex;

use crate::sample::Sample;

/// Recycles sample buffers to avoid one allocation per sample.
///
/// The pool stays small (a handful of buffers per track), so a linear scan
/// on acquire is cheap.
#[derive(Debug, Default)]
pub struct SamplePool {
    samples: Mutex<Vec<Sample>>,
}

impl SamplePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared sample able to hold `size` bytes.
    ///
    /// Picks the smallest pooled buffer that is large enough. If none is,
    /// the largest pooled buffer is grown; an empty pool allocates.
    pub fn acquire(&self, size: usize) -> Sample {
        let mut samples = self.samples.lock();

        let mut best: Option<usize> = None;
        let mut largest: Option<usize> = None;
        for (i, sample) in samples.iter().enumerate() {
            let capacity = sample.data.capacity();
            if capacity >= size
                && best.map_or(true, |b| capacity < samples[b].data.capacity())
            {
                best = Some(i);
            }
            if largest.map_or(true, |l| capacity > samples[l].data.capacity()) {
                largest = Some(i);
            }
        }

        match best.or(largest) {
            Some(i) => {
                let mut sample = samples.swap_remove(i);
                sample.clear();
                sample.data.reserve(size);
                sample
            }
            None => Sample::with_capacity(size),
        }
    }

    /// Return a sample to the pool.
    pub fn release(&self, mut sample: Sample) {
        sample.clear();
        self.samples.lock().push(sample);
    }

    /// Number of idle buffers in the pool.
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_from_empty_pool_allocates() {
        let pool = SamplePool::new();
        let sample = pool.acquire(100);
        assert!(sample.data.capacity() >= 100);
        assert!(sample.data.is_empty());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_acquire_prefers_smallest_fitting_buffer() {
        let pool = SamplePool::new();
        pool.release(Sample::with_capacity(1000));
        pool.release(Sample::with_capacity(200));
        pool.release(Sample::with_capacity(50));

        let sample = pool.acquire(150);
        assert!(sample.data.capacity() >= 200 && sample.data.capacity() < 1000);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_acquire_grows_largest_when_none_fit() {
        let pool = SamplePool::new();
        pool.release(Sample::with_capacity(10));
        pool.release(Sample::with_capacity(20));

        let sample = pool.acquire(4096);
        assert!(sample.data.capacity() >= 4096);
        assert_eq!(pool.len(), 1);
        // The remaining buffer is the smaller one.
        assert!(pool.acquire(0).data.capacity() < 20);
    }

    #[test]
    fn test_release_clears_sample() {
        let pool = SamplePool::new();
        pool.release(Sample::new(10, 1, vec![1, 2, 3]));
        let sample = pool.acquire(1);
        assert_eq!(sample.time_us, 0);
        assert_eq!(sample.flags, 0);
        assert!(sample.data.is_empty());
    }
}
