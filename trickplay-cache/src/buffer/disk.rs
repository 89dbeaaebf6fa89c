//! Disk-backed sample buffer.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::cursor::{Seed, TrackCursor};
use super::{BufferListener, BufferMode, BufferedPosition, ReadResult};
use crate::cache::{CacheManager, EvictionListener};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::sample::{Sample, TrackFormat};
use crate::segment::Segment;

/// Nothing has been written yet.
const NO_POSITION: i64 = i64::MIN;

/// Forwards evictions of one track to the pipeline listener.
struct StartTimeNotifier {
    listener: Arc<dyn BufferListener>,
}

impl EvictionListener for StartTimeNotifier {
    fn on_cache_evicted(&self, _track_id: &str, created_ms: i64) {
        self.listener.on_cache_start_time_changed(created_ms);
    }
}

/// Producer-side state of one track.
struct WriteTrack {
    segment: Option<Arc<Segment>>,
    chunk_start_us: i64,
    last_time_us: Option<i64>,
}

#[derive(Default)]
struct WriterState {
    tracks: Vec<WriteTrack>,
}

#[derive(Default)]
struct ReaderState {
    cursors: Vec<Option<TrackCursor>>,
    position_us: i64,
}

/// Sample buffer storing every track as a chain of segment files.
///
/// Live and record modes write new segments at key frames that cross a
/// chunk boundary; recorded playback reads a chain loaded from storage.
pub struct DiskSampleBuffer {
    mode: BufferMode,
    cache: Arc<CacheManager>,
    config: CacheConfig,
    listener: Option<Arc<dyn BufferListener>>,
    tracks: Mutex<Vec<TrackFormat>>,
    writer: Mutex<WriterState>,
    reader: Mutex<ReaderState>,
    live_edge_us: AtomicI64,
    eos: AtomicBool,
    slow_reported: AtomicBool,
    released: AtomicBool,
}

impl DiskSampleBuffer {
    pub fn new(
        mode: BufferMode,
        cache: Arc<CacheManager>,
        listener: Option<Arc<dyn BufferListener>>,
    ) -> Self {
        let config = cache.config().clone();
        Self {
            mode,
            cache,
            config,
            listener,
            tracks: Mutex::new(Vec::new()),
            writer: Mutex::new(WriterState::default()),
            reader: Mutex::new(ReaderState::default()),
            live_edge_us: AtomicI64::new(NO_POSITION),
            eos: AtomicBool::new(mode == BufferMode::RecordedPlayback),
            slow_reported: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    fn track_id(&self, index: usize) -> Result<String, CacheError> {
        let tracks = self.tracks.lock();
        if tracks.is_empty() {
            return Err(CacheError::NotInitialized);
        }
        tracks
            .get(index)
            .map(|t| t.track_id.clone())
            .ok_or(CacheError::UnknownTrack(index))
    }

    /// Latest written timestamp across all tracks.
    pub fn live_edge_us(&self) -> Option<i64> {
        match self.live_edge_us.load(Ordering::SeqCst) {
            NO_POSITION => None,
            edge => Some(edge),
        }
    }

    // ---------------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------------

    pub fn init(&self, tracks: &[TrackFormat]) -> Result<(), CacheError> {
        let mut known = self.tracks.lock();
        if !known.is_empty() {
            return Err(CacheError::InvalidState("buffer already initialized".into()));
        }

        match self.mode {
            BufferMode::Live | BufferMode::Record => {
                let mut writer = self.writer.lock();
                for track in tracks {
                    let segment = self.cache.create_new_write_file(&track.track_id, 0)?;
                    writer.tracks.push(WriteTrack {
                        segment: Some(segment),
                        chunk_start_us: 0,
                        last_time_us: None,
                    });
                }
            }
            BufferMode::RecordedPlayback => {
                for track in tracks {
                    self.cache.load_track_from_storage(&track.track_id)?;
                }
            }
        }

        known.extend_from_slice(tracks);
        self.reader.lock().cursors = (0..tracks.len()).map(|_| None).collect();
        info!("[SampleBuffer] {:?} buffer with {} tracks", self.mode, tracks.len());

        if self.mode == BufferMode::Live {
            if let Some(listener) = &self.listener {
                listener.on_cache_state_changed(true);
            }
        }
        Ok(())
    }

    pub fn track_formats(&self) -> Vec<TrackFormat> {
        self.tracks.lock().clone()
    }

    fn seed_for(&self, position_us: i64) -> Seed {
        if self.mode == BufferMode::RecordedPlayback {
            return Seed::Historical(position_us);
        }
        match self.live_edge_us() {
            Some(edge) if edge - position_us > self.config.live_threshold_us => {
                Seed::Historical(position_us)
            }
            _ => Seed::Live,
        }
    }

    pub fn select_track(&self, index: usize) -> Result<(), CacheError> {
        let track_id = self.track_id(index)?;
        let mut reader = self.reader.lock();
        let seed = self.seed_for(reader.position_us);
        let slot = reader
            .cursors
            .get_mut(index)
            .ok_or(CacheError::UnknownTrack(index))?;
        if slot.is_some() {
            return Ok(());
        }
        *slot = Some(TrackCursor::new(&track_id, &self.cache, seed));

        if let Some(listener) = &self.listener {
            self.cache.register_eviction_listener(
                &track_id,
                Arc::new(StartTimeNotifier {
                    listener: Arc::clone(listener),
                }),
            );
        }
        debug!("[SampleBuffer] selected {} ({:?})", track_id, seed);
        Ok(())
    }

    pub fn deselect_track(&self, index: usize) -> Result<(), CacheError> {
        let track_id = self.track_id(index)?;
        let cursor = {
            let mut reader = self.reader.lock();
            reader
                .cursors
                .get_mut(index)
                .ok_or(CacheError::UnknownTrack(index))?
                .take()
        };
        if let Some(mut cursor) = cursor {
            cursor.clear(&self.cache);
            self.cache.unregister_eviction_listener(&track_id);
            debug!("[SampleBuffer] deselected {}", track_id);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Producer
    // ---------------------------------------------------------------------

    /// Append `sample` to the track's write segment, opening a new segment
    /// when a key frame crosses the current chunk.
    pub fn write_sample(&self, index: usize, sample: &Sample) -> Result<(), CacheError> {
        if self.mode == BufferMode::RecordedPlayback {
            return Err(CacheError::InvalidState("recorded playback is read-only".into()));
        }
        let track_id = self.track_id(index)?;

        let mut writer = self.writer.lock();
        let track = writer
            .tracks
            .get_mut(index)
            .ok_or(CacheError::UnknownTrack(index))?;
        if track.segment.is_none() {
            return Err(CacheError::InvalidState(format!("track {} has ended", track_id)));
        }

        if sample.is_key_frame()
            && sample.time_us >= track.chunk_start_us + self.config.chunk_duration_us
        {
            let start_us = self.config.chunk_start(sample.time_us);
            let segment = self.cache.create_new_write_file(&track_id, start_us)?;
            track.segment = Some(segment);
            track.chunk_start_us = start_us;
        }

        if let Some(segment) = &track.segment {
            self.cache.write_sample(segment, sample)?;
        }
        track.last_time_us = Some(track.last_time_us.map_or(sample.time_us, |t| t.max(sample.time_us)));
        self.live_edge_us.fetch_max(sample.time_us, Ordering::SeqCst);
        drop(writer);

        self.check_disk_speed();
        Ok(())
    }

    fn check_disk_speed(&self) {
        if self.slow_reported.load(Ordering::SeqCst) || !self.cache.check_write_speed() {
            return;
        }
        if self.slow_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cache.disable();
        if let Some(listener) = &self.listener {
            listener.on_disk_too_slow();
            listener.on_cache_state_changed(false);
        }
    }

    /// Finish every write segment; readers reach end of stream after the
    /// last written sample.
    pub fn set_eos(&self) {
        if self.mode != BufferMode::RecordedPlayback {
            let tracks = self.tracks.lock().clone();
            let mut writer = self.writer.lock();
            for (track, state) in tracks.iter().zip(writer.tracks.iter_mut()) {
                if state.segment.take().is_some() {
                    self.cache.finish_write(&track.track_id);
                }
            }
        }
        self.eos.store(true, Ordering::SeqCst);
        debug!("[SampleBuffer] end of stream");
    }

    // ---------------------------------------------------------------------
    // Consumer
    // ---------------------------------------------------------------------

    pub fn read_sample(&self, index: usize, holder: &mut Sample) -> Result<ReadResult, CacheError> {
        let mut guard = self.reader.lock();
        let reader = &mut *guard;
        let cursor = reader
            .cursors
            .get_mut(index)
            .ok_or(CacheError::UnknownTrack(index))?
            .as_mut()
            .ok_or_else(|| CacheError::InvalidState(format!("track {} is not selected", index)))?;

        cursor.fill(&self.cache, self.config.read_ahead_us);
        if cursor.dequeue(holder) {
            reader.position_us = reader.position_us.max(holder.time_us);
            return Ok(ReadResult::SampleRead);
        }
        if self.eos.load(Ordering::SeqCst) && cursor.is_drained() {
            return Ok(ReadResult::EndOfStream);
        }
        Ok(ReadResult::NothingRead)
    }

    /// Move every selected track to `position_us`. Positions within the
    /// live threshold of the newest sample attach to the write segment.
    pub fn seek_to(&self, position_us: i64) {
        let mut reader = self.reader.lock();
        let seed = self.seed_for(position_us);
        reader.position_us = position_us;
        for cursor in reader.cursors.iter_mut().flatten() {
            cursor.reseed(&self.cache, seed);
        }
        debug!("[SampleBuffer] seek to {}us ({:?})", position_us, seed);
    }

    pub fn buffered_position(&self) -> BufferedPosition {
        let reader = self.reader.lock();
        let eos = self.eos.load(Ordering::SeqCst);
        reader
            .cursors
            .iter()
            .flatten()
            .map(|cursor| {
                if eos && cursor.is_drained() {
                    BufferedPosition::EndOfSource
                } else {
                    match cursor.buffered_us() {
                        Some(us) => BufferedPosition::At(us),
                        None => BufferedPosition::Unknown,
                    }
                }
            })
            .reduce(BufferedPosition::min)
            .unwrap_or(BufferedPosition::Unknown)
    }

    pub fn continue_buffering(&self, position_us: i64) -> bool {
        let mut reader = self.reader.lock();
        reader.position_us = reader.position_us.max(position_us);
        let eos = self.eos.load(Ordering::SeqCst);
        let mut ready = true;
        for cursor in reader.cursors.iter_mut().flatten() {
            cursor.fill(&self.cache, self.config.read_ahead_us);
            ready &= cursor.has_queued() || (eos && cursor.is_drained());
        }
        ready
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Close every track.
    ///
    /// A recording also stores each track's duration, format and segment
    /// index; recorded playback closes the cache manager.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut reader = self.reader.lock();
            for cursor in reader.cursors.iter_mut() {
                if let Some(mut cursor) = cursor.take() {
                    cursor.clear(&self.cache);
                }
            }
        }

        let tracks = self.tracks.lock().clone();
        let last_times: Vec<Option<i64>> = {
            let mut writer = self.writer.lock();
            for (track, state) in tracks.iter().zip(writer.tracks.iter_mut()) {
                if state.segment.take().is_some() {
                    self.cache.finish_write(&track.track_id);
                }
            }
            writer.tracks.iter().map(|t| t.last_time_us).collect()
        };

        if self.mode == BufferMode::Record {
            self.cache.sync();
            for (track, last_time_us) in tracks.iter().zip(last_times) {
                if let Err(e) = self.persist_track(track, last_time_us) {
                    error!("[SampleBuffer] failed to persist {}: {}", track.track_id, e);
                }
            }
        }

        for track in &tracks {
            self.cache.unregister_eviction_listener(&track.track_id);
            self.cache.clear_track(&track.track_id);
        }
        if self.mode == BufferMode::RecordedPlayback {
            self.cache.close();
        }
        info!("[SampleBuffer] released {:?} buffer", self.mode);
    }

    fn persist_track(&self, track: &TrackFormat, last_time_us: Option<i64>) -> Result<(), CacheError> {
        let storage = self.cache.storage();
        let mut stored = track.clone();
        stored.format.duration_us = Some(last_time_us.unwrap_or(0));
        if !stored.format.is_audio() && !stored.format.is_video() {
            warn!("[SampleBuffer] track {} has unknown type {}", track.track_id, track.format.mime_type);
        }
        storage.write_track_info(&stored, stored.format.is_audio())?;
        storage.write_index(&track.track_id, &self.cache.segment_starts(&track.track_id))?;
        Ok(())
    }
}

impl Drop for DiskSampleBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SampleBuffer;
    use crate::sample::{MediaFormat, SAMPLE_FLAG_SYNC};
    use crate::storage::{
        RecordingStorageConfig, RecordingStorageManager, StorageManager, TrickplayStorageConfig,
        TrickplayStorageManager,
    };
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn trickplay_cache(dir: &Path) -> Arc<CacheManager> {
        let storage = Arc::new(TrickplayStorageManager::with_free_space(
            dir,
            TrickplayStorageConfig::default(),
            Arc::new(|_: &Path| Some(1u64 << 40)),
        ));
        CacheManager::new(storage, CacheConfig::default()).unwrap()
    }

    fn recording_storage(dir: &Path) -> Arc<RecordingStorageManager> {
        Arc::new(RecordingStorageManager::with_free_space(
            dir,
            RecordingStorageConfig::default(),
            Arc::new(|_: &Path| Some(1u64 << 40)),
        ))
    }

    fn video() -> TrackFormat {
        TrackFormat::new("video", MediaFormat::video("video/avc", 1280, 720))
    }

    fn frame(time_us: i64, key: bool) -> Sample {
        let flags = if key { SAMPLE_FLAG_SYNC } else { 0 };
        Sample::new(time_us, flags, vec![(time_us / 1000) as u8; 64])
    }

    /// Read until end of stream or until `n` samples were read.
    fn read_n(buffer: &DiskSampleBuffer, index: usize, n: usize) -> (Vec<i64>, bool) {
        let mut times = Vec::new();
        let mut holder = Sample::default();
        let deadline = Instant::now() + Duration::from_secs(10);
        while times.len() < n {
            match buffer.read_sample(index, &mut holder).unwrap() {
                ReadResult::SampleRead => times.push(holder.time_us),
                ReadResult::NothingRead => std::thread::sleep(Duration::from_millis(1)),
                ReadResult::EndOfStream => return (times, true),
            }
            assert!(Instant::now() < deadline, "reader stalled");
        }
        (times, false)
    }

    #[test]
    fn test_key_frames_open_segments_on_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = trickplay_cache(dir.path());
        let buffer = DiskSampleBuffer::new(BufferMode::Live, Arc::clone(&cache), None);
        buffer.init(&[video()]).unwrap();

        // 30 fps with a key frame every 10 frames.
        for i in 0..60 {
            buffer.write_sample(0, &frame(i * 33_333, i % 10 == 0)).unwrap();
        }
        // Key frames at 0, 333330, 666660, 999990, 1333320, 1666650.
        assert_eq!(
            cache.segment_starts("video"),
            vec![0, 500_000, 1_000_000, 1_500_000]
        );
        assert_eq!(buffer.live_edge_us(), Some(59 * 33_333));
    }

    #[test]
    fn test_read_follows_chain_to_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let cache = trickplay_cache(dir.path());
        let buffer = DiskSampleBuffer::new(BufferMode::Live, cache, None);
        buffer.init(&[video()]).unwrap();
        buffer.select_track(0).unwrap();

        for i in 0..40 {
            buffer.write_sample(0, &frame(i * 100_000, i % 5 == 0)).unwrap();
        }
        buffer.set_eos();

        let (times, eos) = read_n(&buffer, 0, usize::MAX);
        assert!(eos);
        assert_eq!(times, (0..40).map(|i| i * 100_000).collect::<Vec<_>>());
        assert_eq!(buffer.buffered_position(), BufferedPosition::EndOfSource);
        assert!(buffer.write_sample(0, &frame(5_000_000, true)).is_err());
    }

    #[test]
    fn test_seek_far_from_live_edge_reads_history() {
        let dir = tempfile::tempdir().unwrap();
        let cache = trickplay_cache(dir.path());
        let buffer = DiskSampleBuffer::new(BufferMode::Live, cache, None);
        buffer.init(&[video()]).unwrap();

        for i in 0..50 {
            buffer.write_sample(0, &frame(i * 100_000, i % 5 == 0)).unwrap();
        }
        buffer.select_track(0).unwrap();

        // Live edge is 4.9s; 1.2s lies in the segment starting at 1.0s.
        buffer.seek_to(1_200_000);
        let (times, _) = read_n(&buffer, 0, 3);
        assert_eq!(times, vec![1_000_000, 1_100_000, 1_200_000]);

        // Within the threshold: attach to the segment being written.
        buffer.seek_to(4_500_000);
        let (times, _) = read_n(&buffer, 0, 1);
        assert_eq!(times, vec![4_500_000]);
    }

    #[test]
    fn test_select_unknown_or_unselected_track() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = DiskSampleBuffer::new(BufferMode::Live, trickplay_cache(dir.path()), None);
        assert!(matches!(buffer.select_track(0), Err(CacheError::NotInitialized)));
        buffer.init(&[video()]).unwrap();

        assert!(matches!(buffer.select_track(3), Err(CacheError::UnknownTrack(3))));
        let mut holder = Sample::default();
        assert!(matches!(
            buffer.read_sample(0, &mut holder),
            Err(CacheError::InvalidState(_))
        ));
        assert!(buffer.init(&[video()]).is_err());
    }

    #[test]
    fn test_record_then_play_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = recording_storage(dir.path());

        {
            let cache = CacheManager::new(storage.clone(), CacheConfig::default()).unwrap();
            let buffer = DiskSampleBuffer::new(BufferMode::Record, Arc::clone(&cache), None);
            buffer.init(&[video()]).unwrap();
            for i in 0..30 {
                buffer.write_sample(0, &frame(i * 100_000, i % 5 == 0)).unwrap();
            }
            buffer.release();
            cache.close();
            assert!(cache.is_closed());
        }

        let info = storage.read_track_info(false).unwrap().unwrap();
        assert_eq!(info.format.duration_us, Some(2_900_000));
        assert_eq!(
            storage.read_index("video").unwrap(),
            vec![0, 500_000, 1_000_000, 1_500_000, 2_000_000, 2_500_000]
        );

        let cache = CacheManager::new(storage.clone(), CacheConfig::default()).unwrap();
        let buffer = DiskSampleBuffer::new(BufferMode::RecordedPlayback, Arc::clone(&cache), None);
        buffer.init(&[info]).unwrap();
        buffer.select_track(0).unwrap();
        let (times, eos) = read_n(&buffer, 0, usize::MAX);
        assert!(eos);
        assert_eq!(times.len(), 30);
        assert!(buffer.write_sample(0, &frame(0, true)).is_err());

        buffer.release();
        assert!(cache.is_closed());
        assert!(dir.path().join("video_0.cache").exists());
    }

    struct CountingListener {
        evictions: Mutex<Vec<i64>>,
        states: Mutex<Vec<bool>>,
    }

    impl BufferListener for CountingListener {
        fn on_cache_start_time_changed(&self, start_time_ms: i64) {
            self.evictions.lock().push(start_time_ms);
        }

        fn on_cache_state_changed(&self, available: bool) {
            self.states.lock().push(available);
        }
    }

    #[test]
    fn test_listener_sees_state_and_evictions() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(TrickplayStorageManager::with_free_space(
            dir.path(),
            TrickplayStorageConfig {
                max_cache_bytes: 4 * 1024,
                ..Default::default()
            },
            Arc::new(|_: &Path| Some(1u64 << 40)),
        ));
        let cache = CacheManager::new(storage, CacheConfig::default()).unwrap();
        let listener = Arc::new(CountingListener {
            evictions: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
        });
        let buffer = DiskSampleBuffer::new(BufferMode::Live, Arc::clone(&cache), Some(listener.clone()));
        buffer.init(&[video()]).unwrap();
        buffer.select_track(0).unwrap();
        assert_eq!(*listener.states.lock(), vec![true]);

        // 80 bytes per record, 5 records per segment: 400 bytes a segment.
        for i in 0..200 {
            buffer.write_sample(0, &frame(i * 100_000, i % 5 == 0)).unwrap();
        }
        cache.sync();
        assert!(cache.cache_size() - cache.pending_delete_size() <= 4 * 1024 + 400);
        assert!(!listener.evictions.lock().is_empty());
        assert!(cache.segment_starts("video").len() < 40);
    }

    #[derive(Default)]
    struct EventLog {
        events: Mutex<Vec<&'static str>>,
    }

    impl BufferListener for EventLog {
        fn on_cache_state_changed(&self, available: bool) {
            self.events.lock().push(if available { "available" } else { "unavailable" });
        }

        fn on_disk_too_slow(&self) {
            self.events.lock().push("too slow");
        }
    }

    /// Ten megabytes at one megabyte per second.
    fn feed_slow_writes(cache: &CacheManager) {
        for _ in 0..10 {
            cache
                .accounting()
                .record_write_timing(1024 * 1024, Duration::from_secs(1));
        }
    }

    #[test]
    fn test_slow_disk_disables_trickplay_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = trickplay_cache(dir.path());
        let listener = Arc::new(EventLog::default());
        let buffer = DiskSampleBuffer::new(BufferMode::Live, Arc::clone(&cache), Some(listener.clone()));
        buffer.init(&[video()]).unwrap();
        buffer.select_track(0).unwrap();

        buffer.write_sample(0, &frame(0, true)).unwrap();
        assert!(!cache.is_disabled());

        feed_slow_writes(&cache);
        buffer.write_sample(0, &frame(100_000, false)).unwrap();
        assert!(cache.is_disabled());
        assert_eq!(*listener.events.lock(), vec!["available", "too slow", "unavailable"]);

        // A second slow window is not reported again.
        feed_slow_writes(&cache);
        buffer.write_sample(0, &frame(200_000, false)).unwrap();
        assert_eq!(listener.events.lock().len(), 3);

        // The current buffer keeps serving what it cached.
        buffer.set_eos();
        let (times, eos) = read_n(&buffer, 0, usize::MAX);
        assert!(eos);
        assert_eq!(times, vec![0, 100_000, 200_000]);

        // The next live buffer falls back to memory.
        let next = SampleBuffer::new(BufferMode::Live, Some(Arc::clone(&cache)), Some(listener.clone())).unwrap();
        assert!(!next.is_disk_backed());
        next.init(&[video()]).unwrap();
        assert_eq!(listener.events.lock().last(), Some(&"unavailable"));
    }
}
