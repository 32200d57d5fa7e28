//! Crate error type.

use crate::cell::CellKey;

/// Errors surfaced by editing and persistence operations.
///
/// Editing failures are always side-effect-free: the map is untouched
/// when an operation returns an error. Queries never use these; an
/// empty result stands in for "found nothing".
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error("frame {frame} out of range (frame count {frame_count})")]
    FrameOutOfRange { frame: usize, frame_count: usize },

    #[error("frames {frame1} and {frame2} are not adjacent")]
    FramesNotAdjacent { frame1: usize, frame2: usize },

    #[error("no cell {key} in frame {frame}")]
    CellNotFound { key: CellKey, frame: usize },

    #[error("cell key {key} already taken in frame {frame}")]
    KeyCollision { key: CellKey, frame: usize },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("not a track file (bad header)")]
    BadHeader,

    #[error("unsupported track file version {0}")]
    UnsupportedVersion(u32),

    #[error("track file has {0} unconsumed trailing bytes")]
    TrailingBytes(usize),
}
