//! Canonical piece table for a torrent's concatenated content
//!
//! Pieces are index-ordered, contiguous and non-overlapping; only the last
//! piece may be shorter than the nominal piece size. The layout is immutable
//! once built. Each piece carries its download state in a `watch` channel so
//! readers can suspend until a piece finishes without polling and without
//! holding any scheduler lock.

use std::ops::RangeInclusive;

use tokio::sync::watch;

use super::{ByteSpan, PieceError, PieceIndex, PieceState};

/// Immutable position of one piece in the concatenated content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Piece {
    pub index: PieceIndex,
    /// Absolute byte offset of the first byte
    pub offset: u64,
    /// Length in bytes
    pub size: u64,
}

impl Piece {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// Piece table with per-piece completion signals.
///
/// Structure is fixed at construction. Only piece state changes, and only
/// through the engine event loop or resume-data replay.
#[derive(Debug)]
pub struct PieceStore {
    pieces: Vec<Piece>,
    states: Vec<watch::Sender<PieceState>>,
    total_length: u64,
}

impl PieceStore {
    /// Builds `count` pieces of `nominal_size` bytes, asking `size_of` for the
    /// actual size of each piece.
    ///
    /// # Errors
    ///
    /// - `PieceError::EmptyLayout` - If `count` is zero
    /// - `PieceError::InvalidPieceSize` - If a piece is empty, larger than
    ///   nominal, or shorter than nominal without being the last piece
    /// - `PieceError::LengthOverflow` - If the sizes add up past `u64::MAX`
    pub fn new(
        count: u32,
        nominal_size: u64,
        size_of: impl Fn(PieceIndex) -> u64,
    ) -> Result<Self, PieceError> {
        if count == 0 {
            return Err(PieceError::EmptyLayout);
        }

        let mut layout = Vec::with_capacity(count as usize);
        let mut offset = 0u64;
        for i in 0..count {
            let index = PieceIndex::new(i);
            let size = size_of(index);
            layout.push((offset, size));
            offset = offset
                .checked_add(size)
                .ok_or(PieceError::LengthOverflow { index })?;
        }

        Self::build(layout, nominal_size)
    }

    /// Splits `total_length` bytes into pieces of `piece_size`; the last piece
    /// takes the remainder.
    ///
    /// # Errors
    ///
    /// - `PieceError::EmptyLayout` - If `total_length` is zero
    /// - `PieceError::InvalidPieceSize` - If `piece_size` is zero
    /// - `PieceError::TooManyPieces` - If the piece count does not fit a
    ///   piece index
    pub fn from_total_length(total_length: u64, piece_size: u64) -> Result<Self, PieceError> {
        if total_length == 0 {
            return Err(PieceError::EmptyLayout);
        }
        if piece_size == 0 {
            return Err(PieceError::InvalidPieceSize {
                index: PieceIndex::new(0),
                size: 0,
                nominal: 0,
            });
        }

        let pieces = total_length.div_ceil(piece_size);
        let count =
            u32::try_from(pieces).map_err(|_| PieceError::TooManyPieces { count: pieces })?;
        let last = PieceIndex::new(count - 1);
        let remainder = total_length % piece_size;

        Self::new(count, piece_size, |index| {
            if index == last && remainder != 0 {
                remainder
            } else {
                piece_size
            }
        })
    }

    /// Accepts an explicit `(offset, size)` layout, as delivered by torrent
    /// metadata. The first piece's size is taken as nominal.
    ///
    /// # Errors
    ///
    /// - `PieceError::EmptyLayout` - If no pieces are given
    /// - `PieceError::NonContiguous` - If a piece does not start where the
    ///   previous one ended (the first must start at 0)
    /// - `PieceError::InvalidPieceSize` - If a size breaks the nominal-size rule
    /// - `PieceError::TooManyPieces` - If the layout has more pieces than a
    ///   piece index can address
    /// - `PieceError::LengthOverflow` - If the layout ends past `u64::MAX`
    pub fn from_layout(layout: Vec<(u64, u64)>) -> Result<Self, PieceError> {
        let nominal = layout.first().map(|&(_, size)| size).ok_or(PieceError::EmptyLayout)?;
        Self::build(layout, nominal)
    }

    fn build(layout: Vec<(u64, u64)>, nominal_size: u64) -> Result<Self, PieceError> {
        if layout.is_empty() {
            return Err(PieceError::EmptyLayout);
        }
        if u32::try_from(layout.len()).is_err() {
            return Err(PieceError::TooManyPieces {
                count: layout.len() as u64,
            });
        }

        let last_position = layout.len() - 1;
        let mut pieces = Vec::with_capacity(layout.len());
        let mut expected_offset = 0u64;

        for (position, (offset, size)) in layout.into_iter().enumerate() {
            let index = PieceIndex::new(position as u32);

            if offset != expected_offset {
                return Err(PieceError::NonContiguous {
                    index,
                    expected_offset,
                    actual_offset: offset,
                });
            }

            let shorter_than_nominal = size < nominal_size && position != last_position;
            if size == 0 || size > nominal_size || shorter_than_nominal {
                return Err(PieceError::InvalidPieceSize {
                    index,
                    size,
                    nominal: nominal_size,
                });
            }

            pieces.push(Piece {
                index,
                offset,
                size,
            });
            expected_offset = offset
                .checked_add(size)
                .ok_or(PieceError::LengthOverflow { index })?;
        }

        let states = pieces
            .iter()
            .map(|_| watch::Sender::new(PieceState::NotAvailable))
            .collect();

        tracing::debug!(
            "Built piece store: {} pieces, {} bytes, nominal piece size {}",
            pieces.len(),
            expected_offset,
            nominal_size
        );

        Ok(Self {
            pieces,
            states,
            total_length: expected_offset,
        })
    }

    /// Number of pieces.
    pub fn len(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Always false; construction rejects empty layouts.
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Sum of all piece sizes.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Size of every piece but possibly the last.
    pub fn nominal_piece_size(&self) -> u64 {
        self.first().size
    }

    /// # Errors
    ///
    /// - `PieceError::IndexOutOfRange` - If `index` is past the last piece
    pub fn get(&self, index: PieceIndex) -> Result<&Piece, PieceError> {
        self.pieces
            .get(index.as_usize())
            .ok_or(PieceError::IndexOutOfRange {
                index,
                count: self.len(),
            })
    }

    pub fn first(&self) -> &Piece {
        &self.pieces[0]
    }

    pub fn last(&self) -> &Piece {
        &self.pieces[self.pieces.len() - 1]
    }

    /// Pieces in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Piece> {
        self.pieces.iter()
    }

    /// Finds the piece holding the byte at `offset`, or `None` when the offset
    /// is outside `[0, total_length)`.
    pub fn find_containing(&self, offset: u64) -> Option<PieceIndex> {
        if offset >= self.total_length {
            return None;
        }
        let position = self.pieces.partition_point(|piece| piece.end() <= offset);
        self.pieces.get(position).map(|piece| piece.index)
    }

    /// Inclusive range of pieces covering `span`, or `None` for an empty span
    /// or one reaching past the content.
    pub fn pieces_in_span(&self, span: ByteSpan) -> Option<RangeInclusive<PieceIndex>> {
        if span.is_empty() || span.end() > self.total_length {
            return None;
        }
        let first = self.find_containing(span.offset)?;
        let last = self.find_containing(span.end() - 1)?;
        Some(first..=last)
    }

    /// # Errors
    ///
    /// - `PieceError::IndexOutOfRange` - If `index` is past the last piece
    pub fn state(&self, index: PieceIndex) -> Result<PieceState, PieceError> {
        self.sender(index).map(|sender| *sender.borrow())
    }

    /// True when the piece exists and has finished.
    pub fn is_finished(&self, index: PieceIndex) -> bool {
        matches!(self.state(index), Ok(PieceState::Finished))
    }

    pub fn finished_count(&self) -> u32 {
        self.states
            .iter()
            .filter(|state| *state.borrow() == PieceState::Finished)
            .count() as u32
    }

    /// Bytes of finished pieces that fall inside `span`.
    pub fn finished_bytes_in(&self, span: ByteSpan) -> u64 {
        let Some(range) = self.pieces_in_span(span) else {
            return 0;
        };
        self.pieces[range.start().as_usize()..=range.end().as_usize()]
            .iter()
            .filter(|piece| self.is_finished(piece.index))
            .map(|piece| span.overlap(piece.offset, piece.end()))
            .sum()
    }

    /// Subscribes to state changes of one piece.
    ///
    /// # Errors
    ///
    /// - `PieceError::IndexOutOfRange` - If `index` is past the last piece
    pub fn subscribe(&self, index: PieceIndex) -> Result<watch::Receiver<PieceState>, PieceError> {
        self.sender(index).map(watch::Sender::subscribe)
    }

    /// Suspends until the piece is finished. Returns immediately if it
    /// already is. Dropping the future cancels the wait.
    ///
    /// # Errors
    ///
    /// - `PieceError::IndexOutOfRange` - If `index` is past the last piece
    /// - `PieceError::StoreClosed` - If the state channel closes while waiting
    pub async fn wait_finished(&self, index: PieceIndex) -> Result<(), PieceError> {
        let mut receiver = self.subscribe(index)?;
        let finished = receiver
            .wait_for(|state| *state == PieceState::Finished)
            .await
            .is_ok();
        if finished {
            Ok(())
        } else {
            Err(PieceError::StoreClosed { index })
        }
    }

    /// Replays persisted completion data. Intended to run before any
    /// scheduler is created for this store.
    ///
    /// # Errors
    ///
    /// - `PieceError::IndexOutOfRange` - If any index is past the last piece;
    ///   indices before it are still applied
    pub fn apply_resume_data(
        &self,
        finished: impl IntoIterator<Item = PieceIndex>,
    ) -> Result<u32, PieceError> {
        let mut restored = 0;
        for index in finished {
            if self.mark_finished(index)? {
                restored += 1;
            }
        }
        tracing::info!("Restored {} finished pieces from resume data", restored);
        Ok(restored)
    }

    /// Moves a piece from `NotAvailable` to `Downloading`. Finished pieces are
    /// never downgraded. Returns whether the state changed.
    pub(crate) fn mark_downloading(&self, index: PieceIndex) -> Result<bool, PieceError> {
        let sender = self.sender(index)?;
        Ok(sender.send_if_modified(|state| {
            if *state == PieceState::NotAvailable {
                *state = PieceState::Downloading;
                true
            } else {
                false
            }
        }))
    }

    /// Marks a piece finished and wakes its waiters. Returns whether the
    /// state changed.
    pub(crate) fn mark_finished(&self, index: PieceIndex) -> Result<bool, PieceError> {
        let sender = self.sender(index)?;
        Ok(sender.send_if_modified(|state| {
            if *state == PieceState::Finished {
                false
            } else {
                *state = PieceState::Finished;
                true
            }
        }))
    }

    pub(crate) fn mark_all_finished(&self) -> u32 {
        self.pieces
            .iter()
            .filter(|piece| matches!(self.mark_finished(piece.index), Ok(true)))
            .count() as u32
    }

    fn sender(&self, index: PieceIndex) -> Result<&watch::Sender<PieceState>, PieceError> {
        self.states
            .get(index.as_usize())
            .ok_or(PieceError::IndexOutOfRange {
                index,
                count: self.len(),
            })
    }
}
