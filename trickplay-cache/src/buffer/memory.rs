//! Memory-only sample buffer for plain live playback.

use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use super::{BufferListener, BufferedPosition, ReadResult};
use crate::error::CacheError;
use crate::pool::SamplePool;
use crate::queue::SampleQueue;
use crate::sample::{Sample, TrackFormat};

#[derive(Default)]
struct MemoryState {
    tracks: Vec<TrackFormat>,
    /// One queue per selected track.
    queues: Vec<Option<SampleQueue>>,
    eos: bool,
}

/// Sample buffer without persistence or seeking.
///
/// Samples for unselected tracks are dropped on write.
pub struct MemorySampleBuffer {
    pool: Arc<SamplePool>,
    listener: Option<Arc<dyn BufferListener>>,
    state: Mutex<MemoryState>,
}

impl MemorySampleBuffer {
    pub fn new(listener: Option<Arc<dyn BufferListener>>) -> Self {
        Self {
            pool: Arc::new(SamplePool::new()),
            listener,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn init(&self, tracks: &[TrackFormat]) -> Result<(), CacheError> {
        {
            let mut state = self.state.lock();
            if !state.tracks.is_empty() {
                return Err(CacheError::InvalidState("buffer already initialized".into()));
            }
            state.tracks = tracks.to_vec();
            state.queues = (0..tracks.len()).map(|_| None).collect();
        }
        info!("[SampleBuffer] memory buffer with {} tracks", tracks.len());
        if let Some(listener) = &self.listener {
            listener.on_cache_state_changed(false);
        }
        Ok(())
    }

    pub fn track_formats(&self) -> Vec<TrackFormat> {
        self.state.lock().tracks.clone()
    }

    pub fn select_track(&self, index: usize) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let slot = state
            .queues
            .get_mut(index)
            .ok_or(CacheError::UnknownTrack(index))?;
        if slot.is_none() {
            *slot = Some(SampleQueue::new(Arc::clone(&self.pool)));
            debug!("[SampleBuffer] selected track {}", index);
        }
        Ok(())
    }

    pub fn deselect_track(&self, index: usize) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        let slot = state
            .queues
            .get_mut(index)
            .ok_or(CacheError::UnknownTrack(index))?;
        // Dropping the queue returns its buffers to the pool.
        *slot = None;
        Ok(())
    }

    pub fn write_sample(&self, index: usize, sample: &Sample) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        if state.eos {
            return Err(CacheError::InvalidState("buffer has ended".into()));
        }
        match state.queues.get_mut(index) {
            Some(Some(queue)) => queue.queue_sample(sample),
            Some(None) => {}
            None => return Err(CacheError::UnknownTrack(index)),
        }
        Ok(())
    }

    pub fn read_sample(&self, index: usize, holder: &mut Sample) -> Result<ReadResult, CacheError> {
        let mut state = self.state.lock();
        let eos = state.eos;
        let queue = state
            .queues
            .get_mut(index)
            .ok_or(CacheError::UnknownTrack(index))?
            .as_mut()
            .ok_or_else(|| CacheError::InvalidState(format!("track {} is not selected", index)))?;

        if queue.dequeue_sample(holder) {
            Ok(ReadResult::SampleRead)
        } else if eos {
            Ok(ReadResult::EndOfStream)
        } else {
            Ok(ReadResult::NothingRead)
        }
    }

    /// Live memory buffers cannot seek; the call is ignored.
    pub fn seek_to(&self, _position_us: i64) {}

    pub fn buffered_position(&self) -> BufferedPosition {
        let state = self.state.lock();
        state
            .queues
            .iter()
            .flatten()
            .map(|queue| match queue.end_position_us() {
                Some(us) => BufferedPosition::At(us),
                None if state.eos => BufferedPosition::EndOfSource,
                None => BufferedPosition::Unknown,
            })
            .reduce(BufferedPosition::min)
            .unwrap_or(BufferedPosition::Unknown)
    }

    pub fn continue_buffering(&self, _position_us: i64) -> bool {
        let state = self.state.lock();
        state
            .queues
            .iter()
            .flatten()
            .all(|queue| state.eos || !queue.is_empty())
    }

    pub fn set_eos(&self) {
        self.state.lock().eos = true;
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        for queue in state.queues.iter_mut() {
            *queue = None;
        }
    }
}
