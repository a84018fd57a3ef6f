//! Piece layout and completion state for one torrent's concatenated content

pub mod piece_store;

use std::fmt;

pub use piece_store::{Piece, PieceStore};

/// Zero-based index of a piece within a torrent.
///
/// Torrent content is divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as usize for slice access.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Download state of a single piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum PieceState {
    /// Nothing received yet
    NotAvailable,
    /// At least one block is in flight
    Downloading,
    /// Fully downloaded and verified by the engine
    Finished,
}

/// Byte range of a file inside the concatenated torrent content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteSpan {
    /// Absolute offset of the first byte
    pub offset: u64,
    /// Number of bytes
    pub length: u64,
}

impl ByteSpan {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of bytes shared with `[start, end)`.
    pub fn overlap(&self, start: u64, end: u64) -> u64 {
        let lo = self.offset.max(start);
        let hi = self.end().min(end);
        hi.saturating_sub(lo)
    }
}

/// Errors raised by piece layout construction and lookups.
#[derive(Debug, thiserror::Error)]
pub enum PieceError {
    #[error("Piece layout is empty")]
    EmptyLayout,

    #[error("Piece {index} starts at {actual_offset}, expected {expected_offset}")]
    NonContiguous {
        index: PieceIndex,
        expected_offset: u64,
        actual_offset: u64,
    },

    #[error("Piece {index} has invalid size {size} (nominal {nominal})")]
    InvalidPieceSize {
        index: PieceIndex,
        size: u64,
        nominal: u64,
    },

    #[error("Layout needs {count} pieces, more than a piece index can address")]
    TooManyPieces { count: u64 },

    #[error("Piece {index} ends past the largest addressable byte offset")]
    LengthOverflow { index: PieceIndex },

    #[error("Piece {index} out of range, store has {count} pieces")]
    IndexOutOfRange { index: PieceIndex, count: u32 },

    #[error("Span {offset}+{length} is empty or exceeds content length {total}")]
    InvalidSpan { offset: u64, length: u64, total: u64 },

    #[error("Piece store closed while waiting for piece {index}")]
    StoreClosed { index: PieceIndex },
}
