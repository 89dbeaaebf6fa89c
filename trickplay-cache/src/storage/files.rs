//! Codecs for track metadata and segment index files.
//!
//! Track info format (big-endian):
//! ```text
//! +----------+------+-----------------------------------------+-----+
//! | track id | mime | max-input/width/height/channels/rate    | par |
//! | i32+utf8 | i32+ | 5 x i32 (-1 = absent)                   | f32 |
//! +----------+------+-----------------------------------------+-----+
//! | codec config slot x 3: i32 len (-1 = absent) + bytes | duration i64 |
//! +-----------------------------------------------------------------------+
//! ```
//!
//! Index format: `i64 count` followed by `count` ascending `i64` segment
//! start positions.

use std::fs;
use std::io;
use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::CacheError;
use crate::sample::{MediaFormat, TrackFormat, MAX_CODEC_CONFIGS};

/// Sentinel for an absent integer field.
const ABSENT: i32 = -1;

/// Sentinel for an absent float field.
const ABSENT_F32: f32 = -1.0;

/// Decoding failure of a metadata or index buffer.
#[derive(Error, Debug, PartialEq)]
pub enum FormatError {
    #[error("truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("invalid length {0}")]
    InvalidLength(i64),

    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), FormatError> {
    if buf.remaining() < needed {
        return Err(FormatError::Truncated {
            needed,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Primitive helpers
// ---------------------------------------------------------------------------

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_i32(value.len() as i32);
    buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, FormatError> {
    ensure(buf, 4)?;
    let len = buf.get_i32();
    if len < 0 {
        return Err(FormatError::InvalidLength(len as i64));
    }
    ensure(buf, len as usize)?;
    let bytes = buf.split_to(len as usize);
    String::from_utf8(bytes.to_vec()).map_err(|_| FormatError::InvalidUtf8)
}

fn put_optional_i32(buf: &mut BytesMut, value: Option<i32>) {
    buf.put_i32(value.unwrap_or(ABSENT));
}

fn get_optional_i32(buf: &mut Bytes) -> Result<Option<i32>, FormatError> {
    ensure(buf, 4)?;
    let value = buf.get_i32();
    Ok((value != ABSENT).then_some(value))
}

fn put_codec_config(buf: &mut BytesMut, config: Option<&Vec<u8>>) {
    match config {
        Some(data) => {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data);
        }
        None => buf.put_i32(ABSENT),
    }
}

fn get_codec_config(buf: &mut Bytes) -> Result<Option<Vec<u8>>, FormatError> {
    ensure(buf, 4)?;
    let len = buf.get_i32();
    if len == ABSENT {
        return Ok(None);
    }
    if len < 0 {
        return Err(FormatError::InvalidLength(len as i64));
    }
    ensure(buf, len as usize)?;
    Ok(Some(buf.split_to(len as usize).to_vec()))
}

// ---------------------------------------------------------------------------
// Track info
// ---------------------------------------------------------------------------

/// Encode a track's id and format.
///
/// Codec-config entries past [`MAX_CODEC_CONFIGS`] are dropped.
pub fn encode_track_info(track: &TrackFormat) -> Bytes {
    let format = &track.format;
    let mut buf = BytesMut::new();

    put_string(&mut buf, &track.track_id);
    put_string(&mut buf, &format.mime_type);
    put_optional_i32(&mut buf, format.max_input_size);
    put_optional_i32(&mut buf, format.width);
    put_optional_i32(&mut buf, format.height);
    put_optional_i32(&mut buf, format.channel_count);
    put_optional_i32(&mut buf, format.sample_rate);
    buf.put_f32(format.pixel_aspect_ratio.unwrap_or(ABSENT_F32));
    for slot in 0..MAX_CODEC_CONFIGS {
        put_codec_config(&mut buf, format.codec_config.get(slot));
    }
    buf.put_i64(format.duration_us.map(|d| d.max(0)).unwrap_or(ABSENT as i64));

    buf.freeze()
}

/// Decode a buffer produced by [`encode_track_info`].
pub fn decode_track_info(mut buf: Bytes) -> Result<TrackFormat, FormatError> {
    let track_id = get_string(&mut buf)?;
    let mime_type = get_string(&mut buf)?;
    let max_input_size = get_optional_i32(&mut buf)?;
    let width = get_optional_i32(&mut buf)?;
    let height = get_optional_i32(&mut buf)?;
    let channel_count = get_optional_i32(&mut buf)?;
    let sample_rate = get_optional_i32(&mut buf)?;

    ensure(&buf, 4)?;
    let par = buf.get_f32();
    let pixel_aspect_ratio = (par != ABSENT_F32).then_some(par);

    let mut codec_config = Vec::new();
    for _ in 0..MAX_CODEC_CONFIGS {
        if let Some(config) = get_codec_config(&mut buf)? {
            codec_config.push(config);
        }
    }

    ensure(&buf, 8)?;
    let duration = buf.get_i64();
    let duration_us = (duration >= 0).then_some(duration);

    if buf.has_remaining() {
        return Err(FormatError::TrailingBytes(buf.remaining()));
    }

    Ok(TrackFormat {
        track_id,
        format: MediaFormat {
            mime_type,
            max_input_size,
            width,
            height,
            channel_count,
            sample_rate,
            pixel_aspect_ratio,
            codec_config,
            duration_us,
        },
    })
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

pub fn encode_index(starts: &[i64]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + starts.len() * 8);
    buf.put_i64(starts.len() as i64);
    for start in starts {
        buf.put_i64(*start);
    }
    buf.freeze()
}

pub fn decode_index(mut buf: Bytes) -> Result<Vec<i64>, FormatError> {
    ensure(&buf, 8)?;
    let count = buf.get_i64();
    if count < 0 {
        return Err(FormatError::InvalidLength(count));
    }
    let needed = (count as usize).checked_mul(8).ok_or(FormatError::InvalidLength(count))?;
    ensure(&buf, needed)?;

    let mut starts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        starts.push(buf.get_i64());
    }
    if buf.has_remaining() {
        return Err(FormatError::TrailingBytes(buf.remaining()));
    }
    Ok(starts)
}

// ---------------------------------------------------------------------------
// File access
// ---------------------------------------------------------------------------

/// Read and decode a track info file. A missing file is `Ok(None)`.
pub fn read_track_info_file(path: &Path) -> Result<Option<TrackFormat>, CacheError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    decode_track_info(Bytes::from(data))
        .map(Some)
        .map_err(|e| corrupted(path, e))
}

pub fn write_track_info_file(path: &Path, track: &TrackFormat) -> Result<(), CacheError> {
    fs::write(path, encode_track_info(track))?;
    Ok(())
}

pub fn read_index_file(path: &Path) -> Result<Vec<i64>, CacheError> {
    let data = fs::read(path)?;
    decode_index(Bytes::from(data)).map_err(|e| corrupted(path, e))
}

pub fn write_index_file(path: &Path, starts: &[i64]) -> Result<(), CacheError> {
    fs::write(path, encode_index(starts))?;
    Ok(())
}

fn corrupted(path: &Path, e: FormatError) -> CacheError {
    CacheError::Corrupted {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_track() -> TrackFormat {
        let mut format = MediaFormat::video("video/avc", 1920, 1080);
        format.max_input_size = Some(1 << 20);
        format.pixel_aspect_ratio = Some(1.0);
        format.codec_config = vec![vec![0, 0, 0, 1, 0x67], vec![0, 0, 0, 1, 0x68]];
        format.duration_us = Some(600_000_000);
        TrackFormat::new("video-0", format)
    }

    #[test]
    fn test_track_info_preserves_fields() {
        let track = video_track();
        let decoded = decode_track_info(encode_track_info(&track)).unwrap();
        assert_eq!(decoded, track);
        assert_eq!(decoded.format.channel_count, None);
    }

    #[test]
    fn test_track_info_layout() {
        let track = TrackFormat::new("a", MediaFormat::audio("audio/mp4a-latm", 2, 48000));
        let buf = encode_track_info(&track);
        // id(4+1) + mime(4+15) + 5 ints + f32 + 3 absent slots + i64
        assert_eq!(buf.len(), 5 + 19 + 20 + 4 + 12 + 8);
        assert_eq!(&buf[..5], &[0, 0, 0, 1, b'a']);
        assert_eq!(&buf[buf.len() - 8..], &[0xFF; 8]);
    }

    #[test]
    fn test_extra_codec_configs_are_dropped() {
        let mut track = video_track();
        track.format.codec_config = vec![vec![1], vec![2], vec![3], vec![4]];
        let decoded = decode_track_info(encode_track_info(&track)).unwrap();
        assert_eq!(decoded.format.codec_config, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_truncated_track_info() {
        let buf = encode_track_info(&video_track());
        let err = decode_track_info(buf.slice(..buf.len() - 3)).unwrap_err();
        assert!(matches!(err, FormatError::Truncated { needed: 8, actual: 5 }));
    }

    #[test]
    fn test_index_encoding() {
        let buf = encode_index(&[0, 500_000]);
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[..8], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(decode_index(buf).unwrap(), vec![0, 500_000]);
        assert_eq!(decode_index(encode_index(&[])).unwrap(), Vec::<i64>::new());
    }

    #[test]
    fn test_index_with_bad_count() {
        let mut buf = BytesMut::new();
        buf.put_i64(3);
        buf.put_i64(0);
        assert!(matches!(
            decode_index(buf.freeze()),
            Err(FormatError::Truncated { needed: 24, actual: 8 })
        ));

        let mut buf = BytesMut::new();
        buf.put_i64(-1);
        assert_eq!(decode_index(buf.freeze()), Err(FormatError::InvalidLength(-1)));
    }

    #[test]
    fn test_missing_track_info_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_track_info_file(&dir.path().join("audio.meta")).unwrap().is_none());
    }

    #[test]
    fn test_corrupted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.index");
        fs::write(&path, [0u8, 1, 2]).unwrap();
        match read_index_file(&path) {
            Err(CacheError::Corrupted { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected {:?}", other),
        }
    }
}
