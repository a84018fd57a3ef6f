//! Piecewise Core - piece scheduling and streaming reads for torrents
//!
//! Turns an unordered stream of piece completions into a download order that
//! gets a media player ready to play quickly, and exposes partially
//! downloaded content as a seekable byte source that suspends only when the
//! byte under the read position is genuinely missing.

pub mod config;
pub mod engine;
pub mod pieces;
pub mod scheduler;
pub mod stats;
pub mod streaming;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::PiecewiseConfig;
pub use engine::{
    EngineEvent, EngineEventSender, FileHandle, SessionError, SessionHandle, spawn_session,
};
pub use pieces::{ByteSpan, Piece, PieceError, PieceIndex, PieceState, PieceStore};
pub use scheduler::{DownloadScheduler, PrioritySink, SchedulerState};
pub use stats::{FileStats, RateAverager, SessionStats, Speed};
pub use streaming::{ContentSource, SeekableByteSource, StreamingError};

/// Errors that can bubble up from any Piecewise subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PiecewiseError {
    #[error("Piece error: {0}")]
    Piece(#[from] PieceError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PiecewiseError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            PiecewiseError::Piece(e) => match e {
                PieceError::EmptyLayout
                | PieceError::NonContiguous { .. }
                | PieceError::InvalidPieceSize { .. }
                | PieceError::TooManyPieces { .. }
                | PieceError::LengthOverflow { .. } => {
                    format!("Torrent metadata describes an invalid piece layout: {e}")
                }
                PieceError::InvalidSpan { .. } => format!("Invalid file range: {e}"),
                _ => "Piece lookup failed".to_string(),
            },
            PiecewiseError::Streaming(StreamingError::OffsetOutOfRange { offset, size }) => {
                format!("Cannot read at byte {offset}, file has {size} bytes")
            }
            PiecewiseError::Streaming(_) => "Streaming read failed".to_string(),
            PiecewiseError::Session(SessionError::SessionClosed) => {
                "Download session has stopped".to_string()
            }
            PiecewiseError::Session(_) => "Download session error".to_string(),
            PiecewiseError::Configuration { reason } => format!("Configuration error: {reason}"),
            PiecewiseError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PiecewiseError::Configuration { .. }
                | PiecewiseError::Piece(PieceError::InvalidSpan { .. })
                | PiecewiseError::Session(SessionError::InvalidFileSpan { .. })
                | PiecewiseError::Streaming(StreamingError::OffsetOutOfRange { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, PiecewiseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_classified() {
        let span: PiecewiseError = SessionError::InvalidFileSpan {
            offset: 0,
            length: 0,
            total: 10,
        }
        .into();
        assert!(span.is_user_error());

        let closed: PiecewiseError = SessionError::SessionClosed.into();
        assert!(!closed.is_user_error());
        assert_eq!(closed.user_message(), "Download session has stopped");
    }

    #[test]
    fn test_out_of_range_message() {
        let error: PiecewiseError = StreamingError::OffsetOutOfRange {
            offset: 100,
            size: 50,
        }
        .into();
        assert_eq!(error.user_message(), "Cannot read at byte 100, file has 50 bytes");
        assert!(error.is_user_error());
    }
}
