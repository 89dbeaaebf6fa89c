//! Drive a sample buffer with a synthetic audio/video program.
//!
//! A writer thread plays the role of the demuxer and the calling thread
//! plays the decoder, so the cache sees the same two-thread access pattern
//! as a tuner session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use trickplay_cache::{
    recording_duration_us, BufferListener, BufferMode, CacheConfig, CacheManager, MediaFormat,
    ReadResult, RecordingStorageManager, Sample, SampleBuffer, StorageManager, TrackFormat,
    TrickplayStorageManager, SAMPLE_FLAG_SYNC,
};

use crate::config::StorageSection;

const VIDEO_FRAME_US: i64 = 33_333;
const VIDEO_GOP: i64 = 15;
const AUDIO_FRAME_US: i64 = 21_333;
const AUDIO_FRAME_BYTES: usize = 384;

pub struct SimulateOptions {
    pub mode: BufferMode,
    pub dir: PathBuf,
    pub duration_secs: u64,
    pub video_kbps: u64,
    /// Pace the writer to the sample timestamps.
    pub realtime: bool,
    /// Start reading from the oldest cached position once writing ends.
    pub replay_from_start: bool,
}

#[derive(Debug, Default)]
pub struct Summary {
    pub written: [u64; 2],
    pub read: [u64; 2],
    pub segments: usize,
    pub cache_bytes: u64,
    pub evictions: u64,
    pub disk_too_slow: bool,
    pub recorded_duration_us: Option<i64>,
    pub elapsed: Duration,
}

#[derive(Default)]
struct SimulationListener {
    evictions: AtomicU64,
    disk_too_slow: AtomicBool,
}

impl BufferListener for SimulationListener {
    fn on_cache_start_time_changed(&self, _start_time_ms: i64) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    fn on_cache_state_changed(&self, available: bool) {
        info!("Trickplay available: {}", available);
    }

    fn on_disk_too_slow(&self) {
        warn!("Disk too slow for trickplay");
        self.disk_too_slow.store(true, Ordering::Relaxed);
    }
}

fn tracks() -> Vec<TrackFormat> {
    let mut video = MediaFormat::video("video/avc", 1920, 1080);
    video.max_input_size = Some(1 << 20);
    video.codec_config = vec![vec![0, 0, 0, 1, 0x67, 0x64, 0x00, 0x28], vec![0, 0, 0, 1, 0x68, 0xEE]];
    let mut audio = MediaFormat::audio("audio/mp4a-latm", 2, 48000);
    audio.codec_config = vec![vec![0x11, 0x90]];
    vec![TrackFormat::new("video", video), TrackFormat::new("audio", audio)]
}

/// Next sample of the interleaved program, in timestamp order.
struct Program {
    video_frame_bytes: usize,
    end_us: i64,
    video: i64,
    audio: i64,
}

impl Program {
    fn new(duration_secs: u64, video_kbps: u64) -> Self {
        let bytes_per_second = video_kbps * 1000 / 8;
        Self {
            video_frame_bytes: (bytes_per_second * VIDEO_FRAME_US as u64 / 1_000_000).max(1) as usize,
            end_us: duration_secs as i64 * 1_000_000,
            video: 0,
            audio: 0,
        }
    }
}

impl Iterator for Program {
    type Item = (usize, Sample);

    fn next(&mut self) -> Option<Self::Item> {
        let video_us = self.video * VIDEO_FRAME_US;
        let audio_us = self.audio * AUDIO_FRAME_US;
        if video_us >= self.end_us && audio_us >= self.end_us {
            return None;
        }
        if video_us <= audio_us && video_us < self.end_us {
            let key = self.video % VIDEO_GOP == 0;
            let size = if key { self.video_frame_bytes * 4 } else { self.video_frame_bytes };
            let flags = if key { SAMPLE_FLAG_SYNC } else { 0 };
            self.video += 1;
            Some((0, Sample::new(video_us, flags, vec![(self.video % 251) as u8; size])))
        } else {
            self.audio += 1;
            Some((1, Sample::new(audio_us, SAMPLE_FLAG_SYNC, vec![0x21; AUDIO_FRAME_BYTES])))
        }
    }
}

fn open_storage(options: &SimulateOptions, storage: &StorageSection) -> Arc<dyn StorageManager> {
    match options.mode {
        BufferMode::Record | BufferMode::RecordedPlayback => Arc::new(
            RecordingStorageManager::with_config(&options.dir, storage.recording()),
        ),
        BufferMode::Live => Arc::new(TrickplayStorageManager::new(&options.dir, storage.trickplay())),
    }
}

fn write_program(
    buffer: &SampleBuffer,
    options: &SimulateOptions,
) -> Result<[u64; 2], trickplay_cache::CacheError> {
    let started = Instant::now();
    let mut written = [0u64; 2];
    for (index, sample) in Program::new(options.duration_secs, options.video_kbps) {
        if options.realtime {
            let due = Duration::from_micros(sample.time_us as u64);
            if let Some(wait) = due.checked_sub(started.elapsed()) {
                thread::sleep(wait);
            }
        }
        buffer.write_sample(index, &sample)?;
        written[index] += 1;
    }
    Ok(written)
}

/// Run one simulation to completion.
pub fn run(
    options: SimulateOptions,
    cache_config: CacheConfig,
    storage: &StorageSection,
) -> Result<Summary, Box<dyn std::error::Error>> {
    if options.mode == BufferMode::RecordedPlayback {
        return Err("simulate writes a program; use `inspect` for recordings".into());
    }
    let started = Instant::now();
    let cache = CacheManager::new(open_storage(&options, storage), cache_config)?;
    let listener = Arc::new(SimulationListener::default());
    let buffer = Arc::new(SampleBuffer::new(
        options.mode,
        Some(Arc::clone(&cache)),
        Some(listener.clone()),
    )?);

    buffer.init(&tracks())?;
    if !options.replay_from_start {
        buffer.select_track(0)?;
        buffer.select_track(1)?;
    }
    info!(
        "Simulating {}s of {:?} into {:?}",
        options.duration_secs, options.mode, options.dir
    );

    let replay_from_start = options.replay_from_start;
    let mut writer = Some({
        let buffer = Arc::clone(&buffer);
        thread::Builder::new()
            .name("trickplay-writer".into())
            .spawn(move || {
                let result = write_program(&buffer, &options);
                buffer.set_eos();
                result
            })?
    });

    let mut summary = Summary::default();
    if replay_from_start {
        summary.written = writer.take().expect("writer joined once").join().map_err(|_| "writer thread panicked")??;
        buffer.seek_to(0);
        buffer.select_track(0)?;
        buffer.select_track(1)?;
    }

    let mut holder = Sample::default();
    let mut ended = [false; 2];
    while !ended.iter().all(|e| *e) {
        let mut progressed = false;
        for index in 0..2 {
            if ended[index] {
                continue;
            }
            match buffer.read_sample(index, &mut holder)? {
                ReadResult::SampleRead => {
                    summary.read[index] += 1;
                    progressed = true;
                }
                ReadResult::NothingRead => {}
                ReadResult::EndOfStream => ended[index] = true,
            }
        }
        if !progressed {
            thread::sleep(Duration::from_millis(1));
        }
    }

    if !replay_from_start {
        summary.written = match writer.take().expect("writer joined once").join().map_err(|_| "writer thread panicked")? {
            Ok(written) => written,
            Err(e) => {
                error!("Writer stopped: {}", e);
                return Err(e.into());
            }
        };
    }

    summary.segments = cache.segment_starts("video").len() + cache.segment_starts("audio").len();
    summary.cache_bytes = cache.cache_size();
    buffer.release();

    summary.evictions = listener.evictions.load(Ordering::Relaxed);
    summary.disk_too_slow = listener.disk_too_slow.load(Ordering::Relaxed);
    if buffer.is_disk_backed() && cache.is_persistent() {
        summary.recorded_duration_us = recording_duration_us(&**cache.storage())?;
    }
    cache.close();
    summary.elapsed = started.elapsed();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_is_interleaved_in_order() {
        let samples: Vec<_> = Program::new(1, 8000).collect();
        let times: Vec<i64> = samples.iter().map(|(_, s)| s.time_us).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);

        let video = samples.iter().filter(|(i, _)| *i == 0).count();
        let audio = samples.iter().filter(|(i, _)| *i == 1).count();
        assert_eq!(video, 31);
        assert_eq!(audio, 47);
        assert!(samples[0].1.is_key_frame());
        assert_eq!(samples[0].1.size(), 33_333 * 4);
    }
}
