//! Piece-bounded, suspension-aware byte source

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{Stream, stream};

use super::{ContentSource, StreamingError};
use crate::pieces::{ByteSpan, PieceError, PieceIndex, PieceStore};

/// Called with the piece a seek is about to wait for.
pub type WaitHook = Arc<dyn Fn(PieceIndex) + Send + Sync>;

/// Seekable view of one file span over a [`PieceStore`].
///
/// Offsets are relative to the span. Every read re-seeks to the current
/// position, so a sequential reader waits for each piece as it crosses into
/// it. Waiting happens on the store's per-piece signal and never touches a
/// scheduler lock; dropping a pending `seek` or `read` cancels the wait.
///
/// With read-ahead enabled, a read pulls the current piece together with the
/// finished pieces right after it from the content source in one call and
/// serves later reads from that buffer. Each `read` still stops at a piece
/// boundary.
pub struct SeekableByteSource {
    store: Arc<PieceStore>,
    content: Arc<dyn ContentSource>,
    span: ByteSpan,
    position: u64,
    on_wait: Option<WaitHook>,
    read_ahead: u64,
    buffered: Option<ReadAhead>,
}

/// Finished bytes already pulled from the content source.
struct ReadAhead {
    /// Absolute offset of `data[0]`
    offset: u64,
    data: Bytes,
}

impl SeekableByteSource {
    /// Source over the whole concatenated content.
    pub fn new(store: Arc<PieceStore>, content: Arc<dyn ContentSource>) -> Self {
        let span = ByteSpan::new(0, store.total_length());
        Self {
            store,
            content,
            span,
            position: 0,
            on_wait: None,
            read_ahead: 0,
            buffered: None,
        }
    }

    /// Source over one file's byte span.
    ///
    /// # Errors
    ///
    /// - `StreamingError::Piece` - If `span` is empty or runs past the content
    pub fn for_span(
        store: Arc<PieceStore>,
        content: Arc<dyn ContentSource>,
        span: ByteSpan,
    ) -> Result<Self, StreamingError> {
        if store.pieces_in_span(span).is_none() {
            return Err(PieceError::InvalidSpan {
                offset: span.offset,
                length: span.length,
                total: store.total_length(),
            }
            .into());
        }
        Ok(Self {
            store,
            content,
            span,
            position: 0,
            on_wait: None,
            read_ahead: 0,
            buffered: None,
        })
    }

    /// Installs a hook run whenever a seek has to suspend.
    pub fn with_wait_hook(mut self, hook: WaitHook) -> Self {
        self.on_wait = Some(hook);
        self
    }

    /// Pulls up to `bytes` of contiguous finished content per source read.
    pub fn with_read_ahead(mut self, bytes: u64) -> Self {
        self.read_ahead = bytes;
        self
    }

    /// Length of the span in bytes.
    pub fn size(&self) -> u64 {
        self.span.length
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.size().saturating_sub(self.position)
    }

    /// Moves to `offset`, waiting until the piece holding it has finished.
    ///
    /// # Errors
    ///
    /// - `StreamingError::OffsetOutOfRange` - If `offset >= size()`
    /// - `StreamingError::Piece` - If the store closes while waiting
    pub async fn seek(&mut self, offset: u64) -> Result<(), StreamingError> {
        self.wait_ready(offset).await?;
        self.position = offset;
        Ok(())
    }

    /// Reads into `buf[at..at + length]` from the current position and
    /// advances it. Returns at most the bytes left in the current piece, and
    /// `Ok(0)` at end of stream.
    ///
    /// # Errors
    ///
    /// - `StreamingError::InvalidBuffer` - If `at + length` exceeds `buf`
    /// - `StreamingError::ShortRead` - If the content source holds less than
    ///   the finished piece promises
    /// - `StreamingError::Io` - If the content source fails
    pub async fn read(
        &mut self,
        buf: &mut [u8],
        at: usize,
        length: usize,
    ) -> Result<usize, StreamingError> {
        let end = at
            .checked_add(length)
            .filter(|&end| end <= buf.len())
            .ok_or(StreamingError::InvalidBuffer {
                at,
                length,
                buffer_len: buf.len(),
            })?;
        if length == 0 || self.bytes_remaining() == 0 {
            return Ok(0);
        }

        let index = self.wait_ready(self.position).await?;
        let piece = self.store.get(index)?;
        let absolute = self.span.offset + self.position;
        let readable = piece.end().min(self.span.end()) - absolute;
        let count = length.min(usize::try_from(readable).unwrap_or(usize::MAX));

        let out = &mut buf[at..end][..count];

        if !self.copy_buffered(absolute, out) {
            if self.read_ahead > count as u64 {
                self.fill_read_ahead(index, absolute).await?;
            }
            if !self.copy_buffered(absolute, out) {
                let actual = self.content.read_at(absolute, out).await?;
                if actual != count {
                    return Err(StreamingError::ShortRead {
                        offset: absolute,
                        expected: count,
                        actual,
                    });
                }
            }
        }

        self.position += count as u64;
        Ok(count)
    }

    /// Reads from the current position to the end of the span.
    ///
    /// # Errors
    ///
    /// Same as [`SeekableByteSource::read`].
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, StreamingError> {
        let chunk = usize::try_from(self.store.nominal_piece_size()).unwrap_or(usize::MAX);
        let mut out = Vec::with_capacity(usize::try_from(self.bytes_remaining()).unwrap_or(0));
        let mut buf = vec![0u8; chunk.min(out.capacity()).max(1)];

        loop {
            let length = buf.len();
            let read = self.read(&mut buf, 0, length).await?;
            if read == 0 {
                break;
            }
            out.extend_from_slice(&buf[..read]);
        }
        Ok(out)
    }

    /// Turns the source into a stream of piece-bounded chunks from the
    /// current position to the end of the span. The stream ends after the
    /// first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, StreamingError>> {
        let chunk = usize::try_from(self.store.nominal_piece_size()).unwrap_or(usize::MAX);
        stream::unfold(Some(self), move |source| async move {
            let mut source = source?;
            let mut buf = BytesMut::zeroed(chunk.min(source.bytes_remaining() as usize).max(1));
            let length = buf.len();
            match source.read(&mut buf, 0, length).await {
                Ok(0) => None,
                Ok(read) => {
                    buf.truncate(read);
                    Some((Ok(buf.freeze()), Some(source)))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Copies `out.len()` bytes at `absolute` from the read-ahead buffer if
    /// it holds all of them.
    fn copy_buffered(&self, absolute: u64, out: &mut [u8]) -> bool {
        let Some(buffered) = &self.buffered else {
            return false;
        };
        let range = absolute
            .checked_sub(buffered.offset)
            .and_then(|start| usize::try_from(start).ok())
            .and_then(|start| Some(start..start.checked_add(out.len())?));
        match range.and_then(|range| buffered.data.get(range)) {
            Some(bytes) => {
                out.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Buffers from `absolute` through the end of piece `index` and on across
    /// the finished pieces after it, up to the read-ahead size and the span
    /// end.
    async fn fill_read_ahead(
        &mut self,
        index: PieceIndex,
        absolute: u64,
    ) -> Result<(), StreamingError> {
        let limit = self.span.end().min(absolute.saturating_add(self.read_ahead));
        let mut end = self.store.get(index)?.end().min(limit);
        let mut next = index;
        while end < limit {
            next = next.next();
            if !self.store.is_finished(next) {
                break;
            }
            end = self.store.get(next)?.end().min(limit);
        }

        let length = usize::try_from(end - absolute).unwrap_or(usize::MAX);
        let mut data = BytesMut::zeroed(length);
        let actual = self.content.read_at(absolute, &mut data).await?;
        if actual != length {
            return Err(StreamingError::ShortRead {
                offset: absolute,
                expected: length,
                actual,
            });
        }

        tracing::trace!("Read ahead {} bytes at {}", length, absolute);
        self.buffered = Some(ReadAhead {
            offset: absolute,
            data: data.freeze(),
        });
        Ok(())
    }

    async fn wait_ready(&self, offset: u64) -> Result<PieceIndex, StreamingError> {
        let out_of_range = StreamingError::OffsetOutOfRange {
            offset,
            size: self.size(),
        };
        if offset >= self.size() {
            return Err(out_of_range);
        }
        let index = self
            .store
            .find_containing(self.span.offset + offset)
            .ok_or(out_of_range)?;

        if !self.store.is_finished(index) {
            tracing::debug!("Read at {} waiting for piece {}", offset, index);
            if let Some(hook) = &self.on_wait {
                hook(index);
            }
            self.store.wait_finished(index).await?;
            tracing::trace!("Piece {} ready, read at {} resumes", index, offset);
        }
        Ok(index)
    }
}

impl fmt::Debug for SeekableByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeekableByteSource")
            .field("span", &self.span)
            .field("position", &self.position)
            .field("has_wait_hook", &self.on_wait.is_some())
            .field("read_ahead", &self.read_ahead)
            .finish()
    }
}
