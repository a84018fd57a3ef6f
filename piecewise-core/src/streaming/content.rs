//! Byte storage behind a seekable source
//!
//! The torrent engine writes verified pieces somewhere; a [`ContentSource`]
//! reads them back by absolute offset in the concatenated content. It is only
//! asked for bytes of finished pieces.

use std::io::SeekFrom;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use super::StreamingError;

/// Absolute-offset reader over downloaded content.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fills as much of `buf` as the source holds starting at absolute
    /// `offset`. Returns the number of bytes copied.
    ///
    /// # Errors
    ///
    /// - `StreamingError::OffsetOutOfRange` - If `offset` is not covered by
    ///   this source
    /// - `StreamingError::Io` - If the backing storage fails
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StreamingError>;

    /// Absolute offset one past the last byte this source covers.
    fn end_offset(&self) -> u64;
}

/// Content held in memory, starting at absolute offset 0.
#[derive(Debug, Clone)]
pub struct MemoryContent {
    data: Bytes,
}

impl MemoryContent {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ContentSource for MemoryContent {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StreamingError> {
        let len = self.data.len() as u64;
        if offset > len {
            return Err(StreamingError::OffsetOutOfRange { offset, size: len });
        }
        let start = offset as usize;
        let count = buf.len().min(self.data.len() - start);
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        Ok(count)
    }

    fn end_offset(&self) -> u64 {
        self.data.len() as u64
    }
}

/// One file on disk, placed at `base_offset` in the concatenated content.
///
/// Reads are serialized on the file handle since each one seeks first.
#[derive(Debug)]
pub struct FileContent {
    file: Mutex<File>,
    base_offset: u64,
    length: u64,
}

impl FileContent {
    /// # Errors
    ///
    /// - `StreamingError::Io` - If the file cannot be opened or stat'ed
    pub async fn open(path: impl AsRef<Path>, base_offset: u64) -> Result<Self, StreamingError> {
        let file = File::open(path.as_ref()).await?;
        let length = file.metadata().await?.len();
        tracing::debug!(
            "Opened content file {} ({} bytes) at offset {}",
            path.as_ref().display(),
            length,
            base_offset
        );
        Ok(Self {
            file: Mutex::new(file),
            base_offset,
            length,
        })
    }
}

#[async_trait]
impl ContentSource for FileContent {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, StreamingError> {
        if offset < self.base_offset || offset > self.end_offset() {
            return Err(StreamingError::OffsetOutOfRange {
                offset,
                size: self.end_offset(),
            });
        }

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset - self.base_offset)).await?;

        let mut filled = 0;
        while filled < buf.len() {
            let read = file.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        Ok(filled)
    }

    fn end_offset(&self) -> u64 {
        self.base_offset + self.length
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[tokio::test]
    async fn test_memory_content_reads_and_truncates() {
        let content = MemoryContent::new(Bytes::from_static(b"0123456789"));
        let mut buf = [0u8; 4];

        assert_eq!(content.read_at(2, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"2345");

        assert_eq!(content.read_at(8, &mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"89");

        assert_eq!(content.read_at(10, &mut buf).await.unwrap(), 0);
        assert!(matches!(
            content.read_at(11, &mut buf).await,
            Err(StreamingError::OffsetOutOfRange { offset: 11, size: 10 })
        ));
    }

    #[tokio::test]
    async fn test_file_content_applies_base_offset() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abcdefghij").unwrap();
        file.flush().unwrap();

        let content = FileContent::open(file.path(), 1000).await.unwrap();
        assert_eq!(content.end_offset(), 1010);

        let mut buf = [0u8; 3];
        assert_eq!(content.read_at(1004, &mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"efg");

        assert!(content.read_at(999, &mut buf).await.is_err());
    }
}
