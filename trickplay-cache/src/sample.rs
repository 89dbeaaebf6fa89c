//! Sample and track format types shared by every layer of the cache.

/// Sample flag: the sample is a key frame (sync sample).
pub const SAMPLE_FLAG_SYNC: i32 = 0x1;

/// Sample flag: decode but do not render.
pub const SAMPLE_FLAG_DECODE_ONLY: i32 = 0x0800_0000;

/// One elementary-stream access unit.
///
/// Buffers are recycled through [`crate::SamplePool`]; the capacity of
/// `data` may exceed its length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sample {
    /// Sample flags (`SAMPLE_FLAG_*`).
    pub flags: i32,
    /// Presentation timestamp in microseconds.
    pub time_us: i64,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl Sample {
    pub fn new(time_us: i64, flags: i32, data: Vec<u8>) -> Self {
        Self {
            flags,
            time_us,
            data,
        }
    }

    /// Create an empty sample whose buffer can hold `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            flags: 0,
            time_us: 0,
            data: Vec::with_capacity(capacity),
        }
    }

    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags & SAMPLE_FLAG_SYNC != 0
    }

    /// Deep-copy `other` into this sample, reusing the existing allocation.
    pub fn copy_from(&mut self, other: &Sample) {
        self.flags = other.flags;
        self.time_us = other.time_us;
        self.data.clear();
        self.data.extend_from_slice(&other.data);
    }

    /// Reset to an empty sample, keeping the allocation.
    pub fn clear(&mut self) {
        self.flags = 0;
        self.time_us = 0;
        self.data.clear();
    }
}

/// Media format of one track.
///
/// Absent fields are `None`; on disk they are written as `-1`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaFormat {
    pub mime_type: String,
    pub max_input_size: Option<i32>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub channel_count: Option<i32>,
    pub sample_rate: Option<i32>,
    pub pixel_aspect_ratio: Option<f32>,
    /// Codec-specific data; at most [`MAX_CODEC_CONFIGS`] entries are persisted.
    pub codec_config: Vec<Vec<u8>>,
    pub duration_us: Option<i64>,
}

/// Number of codec-config slots in a track metadata file.
pub const MAX_CODEC_CONFIGS: usize = 3;

impl MediaFormat {
    pub fn video(mime_type: &str, width: i32, height: i32) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn audio(mime_type: &str, channel_count: i32, sample_rate: i32) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            channel_count: Some(channel_count),
            sample_rate: Some(sample_rate),
            ..Default::default()
        }
    }

    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }
}

/// A track id paired with its format, as handed to `SampleBuffer::init`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackFormat {
    pub track_id: String,
    pub format: MediaFormat,
}

impl TrackFormat {
    pub fn new(track_id: impl Into<String>, format: MediaFormat) -> Self {
        Self {
            track_id: track_id.into(),
            format,
        }
    }
}
