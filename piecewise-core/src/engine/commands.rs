//! Messages flowing into the session actor.

use tokio::sync::oneshot;

use super::handle::FileHandle;
use crate::pieces::{ByteSpan, PieceError, PieceIndex};
use crate::stats::SessionStats;

/// Notifications from the native torrent engine.
///
/// Engine callbacks run on foreign threads; they only enqueue these events
/// and the session actor applies them in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A piece was downloaded and verified.
    PieceDownloaded { piece_index: PieceIndex },
    /// The first block of a piece is in flight.
    PieceDownloading { piece_index: PieceIndex },
    /// The engine finished rechecking data on disk.
    TorrentChecked,
    /// The torrent resumed after a pause or restart.
    TorrentResumed,
    /// Every piece is already on disk.
    AllPiecesCached,
    /// Cumulative transfer counters, sampled by the engine.
    Counters { downloaded: u64, uploaded: u64 },
}

/// Requests served by the session actor.
pub enum SessionCommand {
    /// Open (or return the already opened) file occupying `span`.
    OpenFile {
        name: String,
        span: ByteSpan,
        responder: oneshot::Sender<Result<FileHandle, SessionError>>,
    },
    /// Forget an opened file and withdraw its priorities. Answers whether
    /// the file was still open.
    CloseFile {
        file_id: u64,
        responder: oneshot::Sender<bool>,
    },
    /// Current totals across all opened files.
    Stats {
        responder: oneshot::Sender<SessionStats>,
    },
    /// Stop the actor after answering.
    Shutdown { responder: oneshot::Sender<()> },
}

/// Errors surfaced by session handles.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session actor has shut down")]
    SessionClosed,

    #[error("File span {offset}+{length} is empty or exceeds torrent length {total}")]
    InvalidFileSpan { offset: u64, length: u64, total: u64 },

    #[error("Piece error: {0}")]
    Piece(#[from] PieceError),
}
