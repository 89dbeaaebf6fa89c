//! Error types for the trickplay sample cache.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the cache, storage and buffer layers.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Underlying filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Eviction could not free space on a persistent backend.
    #[error("Out of storage: cannot create segment for track {track_id} at {position_us}us")]
    OutOfStorage { track_id: String, position_us: i64 },

    /// The track already has segments, either written or loaded from storage.
    #[error("Track {0} already has cached segments")]
    TrackAlreadyLoaded(String),

    /// Track index is outside the initialized track list.
    #[error("Unknown track index: {0}")]
    UnknownTrack(usize),

    /// A metadata or index file could not be decoded.
    #[error("Corrupted file {path:?}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    /// Operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Buffer was used before `init`.
    #[error("Buffer not initialized")]
    NotInitialized,
}

impl CacheError {
    /// Returns true if this error means the backing store is full.
    pub fn is_out_of_storage(&self) -> bool {
        matches!(self, CacheError::OutOfStorage { .. })
    }
}
