//! Storage policies and per-track metadata persistence.
//!
//! A [`StorageManager`] tells the cache where to put segment files, how much
//! it may keep, and whether the files outlive the session. Two policies are
//! provided:
//! - [`RecordingStorageManager`]: persistent, never evicted
//! - [`TrickplayStorageManager`]: ephemeral, bounded by a share of free disk

pub mod files;
mod recording;
mod trickplay;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

pub use recording::{RecordingStorageConfig, RecordingStorageManager};
pub use trickplay::{TrickplayStorageConfig, TrickplayStorageManager};

use crate::error::CacheError;
use crate::sample::TrackFormat;
use crate::segment::sanitize_track_id;

/// Default low-space reserve kept free by both policies.
pub const DEFAULT_RESERVED_FREE_BYTES: u64 = 100 * 1024 * 1024;

/// Reports the bytes available to unprivileged users on the filesystem
/// holding a path, or `None` if the probe fails.
pub type FreeSpaceFn = Arc<dyn Fn(&Path) -> Option<u64> + Send + Sync>;

/// Policy and backend for one cache directory.
pub trait StorageManager: Send + Sync {
    /// Directory holding segment, index and metadata files.
    fn cache_dir(&self) -> &Path;

    /// Remove every file in the cache directory.
    fn clear_storage(&self) -> io::Result<()>;

    /// Persistent storage is never evicted and keeps its files on close.
    fn is_persistent(&self) -> bool;

    /// Whether `cache_size` bytes, less those pending deletion, exceed the
    /// policy's maximum.
    fn reached_storage_max(&self, cache_size: u64, pending_delete: u64) -> bool;

    /// Whether free space, counting bytes about to be freed, stays above the
    /// policy's reserve.
    fn has_enough_buffer(&self, pending_delete: u64) -> bool;

    /// Read the stored format of the audio or video track.
    ///
    /// A missing file is not an error: single-track recordings only have one.
    fn read_track_info(&self, is_audio: bool) -> Result<Option<TrackFormat>, CacheError> {
        files::read_track_info_file(&track_info_path(self.cache_dir(), is_audio))
    }

    fn write_track_info(&self, track: &TrackFormat, is_audio: bool) -> Result<(), CacheError> {
        files::write_track_info_file(&track_info_path(self.cache_dir(), is_audio), track)
    }

    /// Read the ascending segment start positions of `track_id`.
    fn read_index(&self, track_id: &str) -> Result<Vec<i64>, CacheError> {
        files::read_index_file(&index_path(self.cache_dir(), track_id))
    }

    fn write_index(&self, track_id: &str, starts: &[i64]) -> Result<(), CacheError> {
        files::write_index_file(&index_path(self.cache_dir(), track_id), starts)
    }
}

pub fn track_info_path(dir: &Path, is_audio: bool) -> PathBuf {
    dir.join(if is_audio { "audio.meta" } else { "video.meta" })
}

pub fn index_path(dir: &Path, track_id: &str) -> PathBuf {
    dir.join(format!("{}.index", sanitize_track_id(track_id)))
}

/// Duration of a finished recording.
///
/// Prefers the video track; audio-only recordings fall back to the audio
/// track info.
pub fn recording_duration_us(storage: &dyn StorageManager) -> Result<Option<i64>, CacheError> {
    let track = match storage.read_track_info(false)? {
        Some(track) => Some(track),
        None => storage.read_track_info(true)?,
    };
    Ok(track.and_then(|t| t.format.duration_us))
}

/// Remove the regular files directly under `dir`. A missing directory is
/// treated as already empty.
pub(crate) fn remove_dir_contents(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!("[Storage] failed to remove {:?}: {}", entry.path(), e);
                continue;
            }
            removed += 1;
        }
    }
    debug!("[Storage] removed {} files from {:?}", removed, dir);
    Ok(())
}

/// Free bytes on the filesystem holding `path`.
#[cfg(unix)]
pub fn free_space(path: &Path) -> Option<u64> {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => Some((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64)),
        Err(e) => {
            warn!("[Storage] statvfs({:?}) failed: {}", path, e);
            None
        }
    }
}

/// Free bytes on the filesystem holding `path`. Not measured on this
/// platform.
#[cfg(not(unix))]
pub fn free_space(_path: &Path) -> Option<u64> {
    Some(u64::MAX)
}

/// The default probe, backed by [`free_space`].
pub fn system_free_space() -> FreeSpaceFn {
    Arc::new(free_space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::MediaFormat;

    #[test]
    fn test_file_names() {
        let dir = Path::new("/cache");
        assert_eq!(track_info_path(dir, true), Path::new("/cache/audio.meta"));
        assert_eq!(track_info_path(dir, false), Path::new("/cache/video.meta"));
        assert_eq!(index_path(dir, "1/video"), Path::new("/cache/1_video.index"));
    }

    #[test]
    fn test_recording_duration_falls_back_to_audio() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordingStorageManager::new(dir.path());
        assert_eq!(recording_duration_us(&storage).unwrap(), None);

        let mut audio = MediaFormat::audio("audio/mp4a-latm", 2, 48000);
        audio.duration_us = Some(42_000_000);
        storage.write_track_info(&TrackFormat::new("a", audio), true).unwrap();
        assert_eq!(recording_duration_us(&storage).unwrap(), Some(42_000_000));

        let mut video = MediaFormat::video("video/avc", 1280, 720);
        video.duration_us = Some(43_000_000);
        storage.write_track_info(&TrackFormat::new("v", video), false).unwrap();
        assert_eq!(recording_duration_us(&storage).unwrap(), Some(43_000_000));
    }

    #[test]
    fn test_remove_dir_contents() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("v_0.cache"), b"x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        remove_dir_contents(dir.path()).unwrap();

        let left: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(left.len(), 1);
        remove_dir_contents(&dir.path().join("missing")).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_free_space_probe() {
        let dir = tempfile::tempdir().unwrap();
        assert!(free_space(dir.path()).is_some());
    }
}
