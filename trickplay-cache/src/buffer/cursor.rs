//! Read position of one selected track inside its segment chain.

use std::sync::Arc;

use log::debug;

use crate::cache::CacheManager;
use crate::queue::SampleQueue;
use crate::sample::Sample;
use crate::segment::{Segment, SegmentRead};

/// Where a cursor attaches in the segment chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Seed {
    /// The segment currently being written.
    Live,
    /// The segment containing this position.
    Historical(i64),
}

/// A track's read queue plus its place in the segment chain.
pub(crate) struct TrackCursor {
    track_id: String,
    queue: SampleQueue,
    segment: Option<Arc<Segment>>,
    pending: Option<Seed>,
    holder: Sample,
    /// Last segment was drained and nothing follows it.
    chain_end: bool,
    last_queued_us: Option<i64>,
}

impl TrackCursor {
    /// Create a cursor, attaching right away if a matching segment exists.
    pub fn new(track_id: &str, cache: &CacheManager, seed: Seed) -> Self {
        let mut cursor = Self {
            track_id: track_id.to_string(),
            queue: SampleQueue::new(Arc::clone(cache.pool())),
            segment: None,
            pending: Some(seed),
            holder: Sample::default(),
            chain_end: false,
            last_queued_us: None,
        };
        cursor.resolve_seed(cache);
        cursor
    }

    /// Drop queued samples and attach again from `seed`.
    pub fn reseed(&mut self, cache: &CacheManager, seed: Seed) {
        self.queue.clear();
        self.detach(cache);
        self.pending = Some(seed);
        self.chain_end = false;
        self.last_queued_us = None;
        self.resolve_seed(cache);
    }

    /// Release the current segment and every queued buffer.
    pub fn clear(&mut self, cache: &CacheManager) {
        self.queue.clear();
        self.detach(cache);
        self.pending = None;
    }

    fn detach(&mut self, cache: &CacheManager) {
        if let Some(segment) = self.segment.take() {
            cache.detach_reader(&segment);
        }
    }

    fn attach(&mut self, cache: &CacheManager, segment: Arc<Segment>) {
        debug!("[TrackCursor] {} reading {:?}", self.track_id, segment.key());
        cache.start_reading(&segment);
        self.segment = Some(segment);
    }

    fn resolve_seed(&mut self, cache: &CacheManager) {
        let seed = match self.pending {
            Some(seed) => seed,
            None => return,
        };
        let segment = match seed {
            Seed::Live => cache
                .active_write_segment(&self.track_id)
                .or_else(|| cache.get_read_file(&self.track_id, i64::MAX)),
            Seed::Historical(position_us) => cache.get_read_file(&self.track_id, position_us),
        };
        if let Some(segment) = segment {
            self.pending = None;
            self.attach(cache, segment);
        }
    }

    /// Pull samples from the segment chain until `read_ahead_us` of media is
    /// queued or nothing more is ready.
    pub fn fill(&mut self, cache: &CacheManager, read_ahead_us: i64) {
        self.resolve_seed(cache);

        while !self.queue.is_duration_greater_than(read_ahead_us) {
            let segment = match &self.segment {
                Some(segment) => Arc::clone(segment),
                None => return,
            };
            match cache.read_sample(&segment, &mut self.holder) {
                SegmentRead::Sample => {
                    self.queue.queue_sample(&self.holder);
                    self.last_queued_us = Some(self.holder.time_us);
                }
                SegmentRead::NothingRead => return,
                SegmentRead::Exhausted => match cache.next_segment(&segment) {
                    Some(next) => {
                        self.detach(cache);
                        self.attach(cache, next);
                    }
                    None => {
                        self.chain_end = segment.is_write_finished() || segment.is_deleted();
                        return;
                    }
                },
            }
        }
    }

    /// Copy the oldest queued sample into `holder`.
    pub fn dequeue(&mut self, holder: &mut Sample) -> bool {
        self.queue.dequeue_sample(holder)
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Every sample of the chain has been handed out.
    pub fn is_drained(&self) -> bool {
        self.chain_end && self.queue.is_empty()
    }

    /// Timestamp of the newest queued sample, or of the last one queued
    /// before the queue ran dry.
    pub fn buffered_us(&self) -> Option<i64> {
        self.queue.end_position_us().or(self.last_queued_us)
    }
}
