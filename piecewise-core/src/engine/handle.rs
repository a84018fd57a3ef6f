//! Handles for talking to the session actor.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use super::commands::{EngineEvent, SessionCommand, SessionError};
use crate::pieces::{ByteSpan, PieceIndex, PieceStore};
use crate::scheduler::DownloadScheduler;
use crate::stats::{FileStats, SessionStats, Speed};
use crate::streaming::{ContentSource, SeekableByteSource, StreamingError, WaitHook};

/// Handle for communicating with a session actor.
///
/// Cheap to clone and safe to share across tasks.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    events: EngineEventSender,
    store: Arc<PieceStore>,
    download_rate: watch::Receiver<Speed>,
    upload_rate: watch::Receiver<Speed>,
}

impl SessionHandle {
    pub(crate) fn new(
        sender: mpsc::Sender<SessionCommand>,
        events: EngineEventSender,
        store: Arc<PieceStore>,
        download_rate: watch::Receiver<Speed>,
        upload_rate: watch::Receiver<Speed>,
    ) -> Self {
        Self {
            sender,
            events,
            store,
            download_rate,
            upload_rate,
        }
    }

    /// Opens the file occupying `span` and starts scheduling its pieces.
    /// Opening the same name again returns the existing handle.
    ///
    /// # Errors
    /// - `SessionError::InvalidFileSpan` - Span is empty or runs past the torrent
    /// - `SessionError::SessionClosed` - Actor has shut down
    pub async fn open_file(
        &self,
        name: impl Into<String>,
        span: ByteSpan,
    ) -> Result<FileHandle, SessionError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SessionCommand::OpenFile {
            name: name.into(),
            span,
            responder,
        };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| SessionError::SessionClosed)?;

        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Totals across all opened files plus current transfer rates.
    ///
    /// # Errors
    /// - `SessionError::SessionClosed` - Actor has shut down
    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SessionCommand::Stats { responder };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| SessionError::SessionClosed)?;

        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    /// Stops the actor. Already opened files keep working for reads but
    /// their schedulers stop receiving engine events.
    ///
    /// # Errors
    /// - `SessionError::SessionClosed` - Actor had already shut down
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SessionCommand::Shutdown { responder };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| SessionError::SessionClosed)?;

        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    /// Sender for native engine callbacks.
    pub fn events(&self) -> EngineEventSender {
        self.events.clone()
    }

    pub fn store(&self) -> &Arc<PieceStore> {
        &self.store
    }

    /// Shared download rate stream.
    pub fn download_rate(&self) -> watch::Receiver<Speed> {
        self.download_rate.clone()
    }

    /// Shared upload rate stream.
    pub fn upload_rate(&self) -> watch::Receiver<Speed> {
        self.upload_rate.clone()
    }
}

/// Thread-safe, non-blocking entry point for native engine callbacks.
///
/// Every method only enqueues; none of them touch scheduler or store state
/// directly.
#[derive(Debug, Clone)]
pub struct EngineEventSender {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEventSender {
    pub(crate) fn new(sender: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { sender }
    }

    /// # Errors
    /// - `SessionError::SessionClosed` - Actor has shut down
    pub fn send(&self, event: EngineEvent) -> Result<(), SessionError> {
        self.sender
            .send(event)
            .map_err(|_| SessionError::SessionClosed)
    }

    pub fn piece_downloaded(&self, piece_index: PieceIndex) -> Result<(), SessionError> {
        self.send(EngineEvent::PieceDownloaded { piece_index })
    }

    pub fn piece_downloading(&self, piece_index: PieceIndex) -> Result<(), SessionError> {
        self.send(EngineEvent::PieceDownloading { piece_index })
    }

    pub fn torrent_checked(&self) -> Result<(), SessionError> {
        self.send(EngineEvent::TorrentChecked)
    }

    pub fn torrent_resumed(&self) -> Result<(), SessionError> {
        self.send(EngineEvent::TorrentResumed)
    }

    pub fn all_pieces_cached(&self) -> Result<(), SessionError> {
        self.send(EngineEvent::AllPiecesCached)
    }

    pub fn counters(&self, downloaded: u64, uploaded: u64) -> Result<(), SessionError> {
        self.send(EngineEvent::Counters {
            downloaded,
            uploaded,
        })
    }
}

/// One opened file of a session.
///
/// Does not keep the session alive: once every [`SessionHandle`] is gone,
/// [`FileHandle::close`] reports `SessionClosed`, while reads of finished
/// pieces keep working.
#[derive(Clone)]
pub struct FileHandle {
    id: u64,
    name: Arc<str>,
    span: ByteSpan,
    store: Arc<PieceStore>,
    content: Arc<dyn ContentSource>,
    scheduler: Arc<DownloadScheduler>,
    sender: mpsc::WeakSender<SessionCommand>,
    read_ahead: u64,
}

impl FileHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        name: Arc<str>,
        span: ByteSpan,
        store: Arc<PieceStore>,
        content: Arc<dyn ContentSource>,
        scheduler: Arc<DownloadScheduler>,
        sender: mpsc::WeakSender<SessionCommand>,
        read_ahead: u64,
    ) -> Self {
        Self {
            id,
            name,
            span,
            store,
            content,
            scheduler,
            sender,
            read_ahead,
        }
    }

    /// Session-unique id, never reused after close.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn span(&self) -> ByteSpan {
        self.span
    }

    pub fn scheduler(&self) -> &Arc<DownloadScheduler> {
        &self.scheduler
    }

    /// New reader positioned at the start of the file. A reader blocked on a
    /// piece pulls the scheduler's priorities to that piece.
    ///
    /// # Errors
    /// - `StreamingError::Piece` - If the file span no longer fits the store
    pub fn open_source(&self) -> Result<SeekableByteSource, StreamingError> {
        let scheduler = Arc::clone(&self.scheduler);
        let hook: WaitHook = Arc::new(move |index| {
            scheduler.on_seek(index);
        });
        let source = SeekableByteSource::for_span(
            Arc::clone(&self.store),
            Arc::clone(&self.content),
            self.span,
        )?;
        Ok(source.with_wait_hook(hook).with_read_ahead(self.read_ahead))
    }

    pub fn stats(&self) -> FileStats {
        FileStats::from_store(&self.store, self.span)
    }

    /// Stops requesting this file's pieces until [`FileHandle::resume`].
    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    /// Waits until every piece of the file is scheduled and done.
    pub async fn await_finished(&self) {
        self.scheduler.wait_finished().await;
    }

    /// Removes the file from the session and withdraws its priorities. Its
    /// scheduler stops receiving engine events; opening the same name again
    /// starts a fresh one. Closing twice is harmless.
    ///
    /// # Errors
    /// - `SessionError::SessionClosed` - Actor has shut down
    pub async fn close(&self) -> Result<(), SessionError> {
        let sender = self.sender.upgrade().ok_or(SessionError::SessionClosed)?;
        let (responder, rx) = oneshot::channel();
        let cmd = SessionCommand::CloseFile {
            file_id: self.id,
            responder,
        };

        sender
            .send(cmd)
            .await
            .map_err(|_| SessionError::SessionClosed)?;

        let was_open = rx.await.map_err(|_| SessionError::SessionClosed)?;
        if !was_open {
            tracing::debug!("File {} was already closed", self.name);
        }
        Ok(())
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("span", &self.span)
            .finish()
    }
}
