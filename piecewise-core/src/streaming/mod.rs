//! Random-access reads over partially downloaded content
//!
//! A [`SeekableByteSource`] lets a player read a file while it is still being
//! downloaded. Reads never cross a piece boundary and suspend only when the
//! piece under the read position has not finished yet.

pub mod content;
pub mod seekable;

pub use content::{ContentSource, FileContent, MemoryContent};
pub use seekable::{SeekableByteSource, WaitHook};

use crate::pieces::PieceError;

/// Errors from seekable reads and the content sources behind them.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    /// Seek or read position outside `[0, size)`. End of stream is reported
    /// as a zero-length read instead.
    #[error("Offset {offset} out of range for source of {size} bytes")]
    OffsetOutOfRange { offset: u64, size: u64 },

    #[error("Buffer slice {at}+{length} exceeds buffer of {buffer_len} bytes")]
    InvalidBuffer {
        at: usize,
        length: usize,
        buffer_len: usize,
    },

    #[error("Piece error: {0}")]
    Piece(#[from] PieceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The content source returned fewer bytes than a finished piece holds.
    #[error("Short read at {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },
}
