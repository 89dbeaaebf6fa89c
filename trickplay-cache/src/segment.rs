//! One cache file holding a contiguous run of samples for a single track.
//!
//! Record format (big-endian, append-only):
//!
//! ```text
//! +--------+--------+-------------+-----------------+
//! | Size   | Flags  | TimestampUs |     Payload     |
//! | i32 BE | i32 BE |   i64 BE    |   Size bytes    |
//! +--------+--------+-------------+-----------------+
//! ```
//!
//! All file access runs on the owning cache manager's [`IoWorker`]. Callers
//! only touch the in-memory state: the read side hands out samples that the
//! worker has already read ahead into a small holding area.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::cache::CacheAccounting;
use crate::error::CacheError;
use crate::io_worker::IoWorker;
use crate::pool::SamplePool;
use crate::sample::Sample;

/// Record header size: 4 (size) + 4 (flags) + 8 (timestamp) = 16 bytes.
pub const RECORD_HEADER_SIZE: u64 = 16;

/// Identity of a segment: its track and the position it starts at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentKey {
    pub track_id: String,
    pub start_us: i64,
}

impl SegmentKey {
    pub fn new(track_id: impl Into<String>, start_us: i64) -> Self {
        Self {
            track_id: track_id.into(),
            start_us,
        }
    }

    /// Deterministic file name for this segment.
    pub fn file_name(&self) -> String {
        format!("{}_{}.cache", sanitize_track_id(&self.track_id), self.start_us)
    }
}

/// Make a track id safe to embed in a file name.
pub fn sanitize_track_id(track_id: &str) -> String {
    track_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Write side of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    OpenWrite,
    FinishedWrite,
}

/// Read side of a segment. `Deleted` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    NotStarted,
    Reading,
    Exhausted,
    Deleted,
}

/// Outcome of [`Segment::read_sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRead {
    /// A sample was copied into the holder.
    Sample,
    /// No sample is ready yet; poll again later.
    NothingRead,
    /// Writing has finished and every sample has been consumed, or the
    /// segment is gone.
    Exhausted,
}

/// Dependencies every segment of one cache manager shares.
#[derive(Clone)]
pub(crate) struct SegmentEnv {
    pub pool: Arc<SamplePool>,
    pub accounting: Arc<CacheAccounting>,
    /// Samples held in memory before read-ahead pauses.
    pub read_ahead: usize,
    /// Whether the file outlives the segment (recordings).
    pub persistent: bool,
}

struct SegmentState {
    write: WriteState,
    read: ReadState,
    write_offset: u64,
    read_offset: u64,
    holding: VecDeque<Sample>,
    read_generation: u64,
    fill_scheduled: bool,
    delete_requested: bool,
    last_time_us: Option<i64>,
}

impl SegmentState {
    fn new(write: WriteState, write_offset: u64) -> Self {
        Self {
            write,
            read: ReadState::NotStarted,
            write_offset,
            read_offset: 0,
            holding: VecDeque::new(),
            read_generation: 0,
            fill_scheduled: false,
            delete_requested: false,
            last_time_us: None,
        }
    }

    fn can_read_more(&self) -> bool {
        !(self.write == WriteState::FinishedWrite
            && self.read_offset >= self.write_offset
            && self.holding.is_empty())
    }
}

#[derive(Default)]
struct SegmentFiles {
    writer: Option<File>,
    reader: Option<File>,
    reader_pos: u64,
}

/// A cache file for one track, starting at `key.start_us`.
pub struct Segment {
    key: SegmentKey,
    path: PathBuf,
    created_ms: i64,
    env: SegmentEnv,
    state: Mutex<SegmentState>,
    files: Mutex<SegmentFiles>,
}

impl Segment {
    /// A fresh, empty segment open for writing.
    pub(crate) fn create(key: SegmentKey, dir: &Path, env: SegmentEnv) -> Arc<Self> {
        let path = dir.join(key.file_name());
        Arc::new(Self {
            key,
            path,
            created_ms: chrono::Utc::now().timestamp_millis(),
            env,
            state: Mutex::new(SegmentState::new(WriteState::OpenWrite, 0)),
            files: Mutex::new(SegmentFiles::default()),
        })
    }

    /// Adopt an existing segment file, e.g. from an interrupted recording.
    ///
    /// The write offset is the current file length and the segment is
    /// immediately read-only.
    pub(crate) fn from_file(key: SegmentKey, dir: &Path, env: SegmentEnv) -> io::Result<Arc<Self>> {
        let path = dir.join(key.file_name());
        let metadata = fs::metadata(&path)?;
        let created_ms = metadata
            .modified()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
            .unwrap_or_else(|_| chrono::Utc::now().timestamp_millis());
        let length = metadata.len();
        env.accounting.on_adopt(length);

        Ok(Arc::new(Self {
            key,
            path,
            created_ms,
            env,
            state: Mutex::new(SegmentState::new(WriteState::FinishedWrite, length)),
            files: Mutex::new(SegmentFiles::default()),
        }))
    }

    pub fn key(&self) -> &SegmentKey {
        &self.key
    }

    pub fn start_us(&self) -> i64 {
        self.key.start_us
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wall-clock creation time in milliseconds.
    pub fn created_ms(&self) -> i64 {
        self.created_ms
    }

    /// Bytes written to the file.
    pub fn size(&self) -> u64 {
        self.state.lock().write_offset
    }

    pub fn write_state(&self) -> WriteState {
        self.state.lock().write
    }

    pub fn read_state(&self) -> ReadState {
        self.state.lock().read
    }

    pub fn is_write_finished(&self) -> bool {
        self.write_state() == WriteState::FinishedWrite
    }

    pub fn is_deleted(&self) -> bool {
        self.read_state() == ReadState::Deleted
    }

    /// Timestamp of the last sample written through this handle.
    pub fn last_time_us(&self) -> Option<i64> {
        self.state.lock().last_time_us
    }

    // ---------------------------------------------------------------------
    // Write side
    // ---------------------------------------------------------------------

    /// Append `sample`, blocking until the worker has written it.
    ///
    /// Writes to a deleted segment are silently dropped.
    pub(crate) fn write_sample(
        self: &Arc<Self>,
        worker: &IoWorker,
        sample: &Sample,
        soft_timeout: Duration,
    ) -> Result<(), CacheError> {
        {
            let state = self.state.lock();
            if state.read == ReadState::Deleted {
                return Ok(());
            }
            if state.write == WriteState::FinishedWrite {
                return Err(CacheError::InvalidState(format!(
                    "segment {:?} is finished",
                    self.key
                )));
            }
        }

        let mut copy = self.env.pool.acquire(sample.size());
        copy.copy_from(sample);
        let segment = Arc::clone(self);
        worker.call(soft_timeout, move || segment.do_write(copy));
        Ok(())
    }

    /// Close the write side. Queued after any pending writes.
    pub(crate) fn finish_write(self: &Arc<Self>, worker: &IoWorker) {
        let segment = Arc::clone(self);
        worker.submit(move || segment.do_finish_write());
    }

    fn do_write(&self, sample: Sample) {
        {
            let state = self.state.lock();
            if state.read == ReadState::Deleted || state.write == WriteState::FinishedWrite {
                drop(state);
                self.env.pool.release(sample);
                return;
            }
        }

        let record = encode_record(&sample);
        let started = Instant::now();
        let result = self.append(&record);
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                let len = record.len() as u64;
                {
                    let mut state = self.state.lock();
                    state.write_offset += len;
                    state.last_time_us = Some(sample.time_us);
                }
                self.env.accounting.on_write(len, elapsed);
                self.fill_read_ahead();
            }
            Err(e) => {
                error!("[Segment] write to {:?} failed: {}", self.path, e);
                self.dispose(!self.env.persistent);
            }
        }
        self.env.pool.release(sample);
    }

    fn append(&self, record: &[u8]) -> io::Result<()> {
        let mut files = self.files.lock();
        if files.writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            files.writer = Some(file);
        }
        match files.writer.as_mut() {
            Some(writer) => writer.write_all(record),
            None => Ok(()),
        }
    }

    fn do_finish_write(&self) {
        self.files.lock().writer = None;
        {
            let mut state = self.state.lock();
            if state.write == WriteState::FinishedWrite {
                return;
            }
            state.write = WriteState::FinishedWrite;
        }
        debug!("[Segment] finished {:?} ({} bytes)", self.key, self.size());
        self.fill_read_ahead();
        self.maybe_delete();
    }

    // ---------------------------------------------------------------------
    // Read side
    // ---------------------------------------------------------------------

    /// Attach a reader at the start of the file.
    ///
    /// Any samples read ahead for a previous reader are discarded.
    pub(crate) fn start_reading(&self) {
        let mut state = self.state.lock();
        if state.read == ReadState::Deleted {
            return;
        }
        state.read = ReadState::Reading;
        state.read_offset = 0;
        state.read_generation += 1;
        for sample in state.holding.drain(..) {
            self.env.pool.release(sample);
        }
    }

    /// Detach the reader. A pending delete is carried out once the worker
    /// gets to it.
    pub(crate) fn detach_reader(self: &Arc<Self>, worker: &IoWorker) {
        {
            let mut state = self.state.lock();
            if state.read == ReadState::Deleted {
                return;
            }
            state.read = ReadState::NotStarted;
            state.read_offset = 0;
            state.read_generation += 1;
            for sample in state.holding.drain(..) {
                self.env.pool.release(sample);
            }
        }
        let segment = Arc::clone(self);
        worker.submit(move || {
            segment.files.lock().reader = None;
            segment.maybe_delete();
        });
    }

    /// Copy the next sample into `holder`. Never blocks on I/O.
    pub(crate) fn read_sample(self: &Arc<Self>, worker: &IoWorker, holder: &mut Sample) -> SegmentRead {
        let mut state = self.state.lock();
        match state.read {
            ReadState::Deleted => return SegmentRead::Exhausted,
            ReadState::NotStarted => {
                state.read = ReadState::Reading;
                state.read_generation += 1;
            }
            ReadState::Reading | ReadState::Exhausted => {}
        }

        if let Some(sample) = state.holding.pop_front() {
            holder.copy_from(&sample);
            self.env.pool.release(sample);
            self.schedule_fill(&mut state, worker);
            return SegmentRead::Sample;
        }

        if !state.can_read_more() {
            state.read = ReadState::Exhausted;
            if state.delete_requested {
                drop(state);
                let segment = Arc::clone(self);
                worker.submit(move || segment.maybe_delete());
            }
            return SegmentRead::Exhausted;
        }

        self.schedule_fill(&mut state, worker);
        SegmentRead::NothingRead
    }

    fn schedule_fill(self: &Arc<Self>, state: &mut SegmentState, worker: &IoWorker) {
        if state.fill_scheduled
            || state.holding.len() >= self.env.read_ahead
            || state.read_offset >= state.write_offset
        {
            return;
        }
        state.fill_scheduled = true;
        let segment = Arc::clone(self);
        if !worker.submit(move || segment.fill_read_ahead()) {
            state.fill_scheduled = false;
        }
    }

    /// Read records into the holding area until it is full or the reader
    /// has caught up with the writer. Runs on the worker.
    fn fill_read_ahead(&self) {
        let (generation, mut offset, limit, wanted) = {
            let mut state = self.state.lock();
            state.fill_scheduled = false;
            if state.read != ReadState::Reading {
                return;
            }
            (
                state.read_generation,
                state.read_offset,
                state.write_offset,
                self.env.read_ahead.saturating_sub(state.holding.len()),
            )
        };

        let mut loaded = Vec::new();
        {
            let mut files = self.files.lock();
            while loaded.len() < wanted && offset + RECORD_HEADER_SIZE <= limit {
                match self.read_record(&mut files, offset, limit) {
                    Ok(Some(sample)) => {
                        offset += RECORD_HEADER_SIZE + sample.size() as u64;
                        loaded.push(sample);
                    }
                    Ok(None) => {
                        warn!(
                            "[Segment] truncated record at {} in {:?}, skipping tail",
                            offset, self.path
                        );
                        offset = limit;
                    }
                    Err(e) => {
                        error!("[Segment] read from {:?} failed: {}", self.path, e);
                        drop(files);
                        for sample in loaded {
                            self.env.pool.release(sample);
                        }
                        self.dispose(!self.env.persistent);
                        return;
                    }
                }
            }
        }

        let mut state = self.state.lock();
        if state.read_generation != generation || state.read != ReadState::Reading {
            for sample in loaded {
                self.env.pool.release(sample);
            }
            return;
        }
        state.read_offset = offset;
        state.holding.extend(loaded);
    }

    /// Read one record at `offset`. `Ok(None)` means the record runs past
    /// the end of the written data.
    fn read_record(
        &self,
        files: &mut SegmentFiles,
        offset: u64,
        limit: u64,
    ) -> io::Result<Option<Sample>> {
        if files.reader.is_none() {
            files.reader = Some(File::open(&self.path)?);
            files.reader_pos = 0;
        }
        let SegmentFiles {
            reader, reader_pos, ..
        } = files;
        let reader = match reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };

        if *reader_pos != offset {
            reader.seek(SeekFrom::Start(offset))?;
            *reader_pos = offset;
        }

        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        reader.read_exact(&mut header)?;
        *reader_pos += RECORD_HEADER_SIZE;
        let mut buf = &header[..];
        let size = buf.get_i32();
        let flags = buf.get_i32();
        let time_us = buf.get_i64();

        if size < 0 || offset + RECORD_HEADER_SIZE + size as u64 > limit {
            return Ok(None);
        }

        let mut sample = self.env.pool.acquire(size as usize);
        sample.flags = flags;
        sample.time_us = time_us;
        sample.data.resize(size as usize, 0);
        if let Err(e) = reader.read_exact(&mut sample.data) {
            self.env.pool.release(sample);
            return Err(e);
        }
        *reader_pos += size as u64;
        Ok(Some(sample))
    }

    // ---------------------------------------------------------------------
    // Deletion
    // ---------------------------------------------------------------------

    /// Flag the segment for deletion. The file is removed once no reader
    /// can read more from it.
    pub(crate) fn request_delete(self: &Arc<Self>, worker: &IoWorker) {
        self.state.lock().delete_requested = true;
        let segment = Arc::clone(self);
        worker.submit(move || segment.maybe_delete());
    }

    /// Close the segment right away, regardless of any reader.
    pub(crate) fn close(self: &Arc<Self>, worker: &IoWorker, remove_file: bool) {
        let segment = Arc::clone(self);
        if !worker.submit(move || segment.dispose(remove_file)) {
            // Worker is gone; nothing else can touch the files.
            self.dispose(remove_file);
        }
    }

    fn maybe_delete(&self) {
        {
            let state = self.state.lock();
            if !state.delete_requested {
                return;
            }
            if state.read == ReadState::Deleted {
                // Disposed on its own before the eviction was settled.
                drop(state);
                self.env.accounting.clear_pending_delete(&self.key);
                return;
            }
            if state.read == ReadState::Reading && state.can_read_more() {
                return;
            }
        }
        self.dispose(true);
    }

    /// Release handles and buffers, optionally removing the file. Terminal.
    fn dispose(&self, remove_file: bool) {
        let size = {
            let mut state = self.state.lock();
            if state.read == ReadState::Deleted {
                return;
            }
            state.read = ReadState::Deleted;
            for sample in state.holding.drain(..) {
                self.env.pool.release(sample);
            }
            state.write_offset
        };

        {
            let mut files = self.files.lock();
            files.writer = None;
            files.reader = None;
        }

        if remove_file {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!("[Segment] removed {:?}", self.path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("[Segment] failed to remove {:?}: {}", self.path, e),
            }
        }
        self.env.accounting.on_delete(&self.key, size);
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("created_ms", &self.created_ms)
            .finish()
    }
}

/// Encode one sample as an on-disk record.
pub fn encode_record(sample: &Sample) -> BytesMut {
    let mut record = BytesMut::with_capacity(RECORD_HEADER_SIZE as usize + sample.size());
    record.put_i32(sample.size() as i32);
    record.put_i32(sample.flags);
    record.put_i64(sample.time_us);
    record.put_slice(&sample.data);
    record
}
