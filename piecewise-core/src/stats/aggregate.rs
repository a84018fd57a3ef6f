//! Per-file and per-session transfer statistics

use std::iter::Sum;
use std::ops::Add;

use serde::Serialize;

use crate::pieces::{ByteSpan, PieceStore};

/// Transfer speed. `Unspecified` means a transfer is active but its rate is
/// not known yet, which is different from a measured zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum Speed {
    #[default]
    Unspecified,
    BytesPerSecond(u64),
}

impl Speed {
    pub const ZERO: Speed = Speed::BytesPerSecond(0);

    pub fn is_unspecified(self) -> bool {
        matches!(self, Speed::Unspecified)
    }

    pub fn bytes_per_second(self) -> Option<u64> {
        match self {
            Speed::Unspecified => None,
            Speed::BytesPerSecond(value) => Some(value),
        }
    }
}

/// Any unknown operand makes the sum unknown.
impl Add for Speed {
    type Output = Speed;

    fn add(self, rhs: Speed) -> Speed {
        match (self, rhs) {
            (Speed::BytesPerSecond(a), Speed::BytesPerSecond(b)) => {
                Speed::BytesPerSecond(a.saturating_add(b))
            }
            _ => Speed::Unspecified,
        }
    }
}

impl Sum for Speed {
    fn sum<I: Iterator<Item = Speed>>(iter: I) -> Speed {
        iter.fold(Speed::ZERO, Add::add)
    }
}

fn progress_of(downloaded: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (downloaded as f64 / total as f64) as f32
    }
}

/// Download progress of one file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FileStats {
    pub downloaded_bytes: u64,
    pub total_size: u64,
    /// `downloaded_bytes / total_size`, or 0 for an empty file
    pub progress: f32,
}

impl FileStats {
    pub fn new(downloaded_bytes: u64, total_size: u64) -> Self {
        Self {
            downloaded_bytes,
            total_size,
            progress: progress_of(downloaded_bytes, total_size),
        }
    }

    /// Counts finished pieces clipped to the file's span.
    pub fn from_store(store: &PieceStore, span: ByteSpan) -> Self {
        Self::new(store.finished_bytes_in(span), span.length)
    }
}

/// Totals for a session, or for several sessions merged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SessionStats {
    pub total_size_requested: u64,
    pub downloaded_bytes: u64,
    pub download_speed: Speed,
    pub uploaded_bytes: u64,
    pub upload_speed: Speed,
    pub download_progress: f32,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            total_size_requested: 0,
            downloaded_bytes: 0,
            download_speed: Speed::ZERO,
            uploaded_bytes: 0,
            upload_speed: Speed::ZERO,
            download_progress: 0.0,
        }
    }
}

impl SessionStats {
    /// Sums file progress. Speeds start as unknown until a transfer report
    /// is attached with [`SessionStats::with_transfer`].
    pub fn from_files<'a>(files: impl IntoIterator<Item = &'a FileStats>) -> Self {
        let (total, downloaded) = files
            .into_iter()
            .fold((0u64, 0u64), |(total, downloaded), file| {
                (total + file.total_size, downloaded + file.downloaded_bytes)
            });
        Self {
            total_size_requested: total,
            downloaded_bytes: downloaded,
            download_speed: Speed::Unspecified,
            uploaded_bytes: 0,
            upload_speed: Speed::Unspecified,
            download_progress: progress_of(downloaded, total),
        }
    }

    pub fn with_transfer(
        mut self,
        download_speed: Speed,
        uploaded_bytes: u64,
        upload_speed: Speed,
    ) -> Self {
        self.download_speed = download_speed;
        self.uploaded_bytes = uploaded_bytes;
        self.upload_speed = upload_speed;
        self
    }

    /// Combines two sources; progress is recomputed from the summed bytes.
    pub fn merge(self, other: SessionStats) -> SessionStats {
        let total = self.total_size_requested + other.total_size_requested;
        let downloaded = self.downloaded_bytes + other.downloaded_bytes;
        SessionStats {
            total_size_requested: total,
            downloaded_bytes: downloaded,
            download_speed: self.download_speed + other.download_speed,
            uploaded_bytes: self.uploaded_bytes + other.uploaded_bytes,
            upload_speed: self.upload_speed + other.upload_speed,
            download_progress: progress_of(downloaded, total),
        }
    }
}

impl Sum for SessionStats {
    fn sum<I: Iterator<Item = SessionStats>>(iter: I) -> SessionStats {
        iter.fold(SessionStats::default(), SessionStats::merge)
    }
}
