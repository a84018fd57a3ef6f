//! Session actor: the single consumer of engine events.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::commands::{EngineEvent, SessionCommand, SessionError};
use super::handle::{EngineEventSender, FileHandle, SessionHandle};
use super::priorities::PriorityUnion;
use crate::config::PiecewiseConfig;
use crate::pieces::{ByteSpan, PieceIndex, PieceStore};
use crate::scheduler::{DownloadScheduler, PrioritySink};
use crate::stats::{FileStats, SessionStats, Speed, spawn_rate_stream};
use crate::streaming::ContentSource;

/// Spawns the session actor for one torrent and returns its handle.
///
/// `store` should already hold any resume data. Engine events are applied to
/// the store first and then fanned out to the schedulers of opened files, so
/// a scheduler never observes a completion the store does not have. Must be
/// called from within a tokio runtime.
pub fn spawn_session(
    store: Arc<PieceStore>,
    content: Arc<dyn ContentSource>,
    sink: Arc<dyn PrioritySink>,
    config: PiecewiseConfig,
) -> SessionHandle {
    let (sender, receiver) = mpsc::channel(config.session.command_buffer.max(1));
    let (event_sender, event_receiver) = mpsc::unbounded_channel();

    let (downloaded, downloaded_rx) = watch::channel(0u64);
    let (uploaded, uploaded_rx) = watch::channel(0u64);
    let download_rate = spawn_rate_stream(downloaded_rx, config.stats.tick_interval);
    let upload_rate = spawn_rate_stream(uploaded_rx, config.stats.tick_interval);

    let actor = SessionActor {
        store: Arc::clone(&store),
        content,
        priorities: PriorityUnion::new(sink),
        config,
        commands: sender.downgrade(),
        files: Vec::new(),
        next_file_id: 0,
        downloaded,
        uploaded,
        download_rate: download_rate.clone(),
        upload_rate: upload_rate.clone(),
    };

    tokio::spawn(async move {
        run_actor_loop(actor, receiver, event_receiver).await;
    });

    SessionHandle::new(
        sender,
        EngineEventSender::new(event_sender),
        store,
        download_rate,
        upload_rate,
    )
}

struct SessionActor {
    store: Arc<PieceStore>,
    content: Arc<dyn ContentSource>,
    priorities: Arc<PriorityUnion>,
    config: PiecewiseConfig,
    commands: mpsc::WeakSender<SessionCommand>,
    files: Vec<FileHandle>,
    next_file_id: u64,
    downloaded: watch::Sender<u64>,
    uploaded: watch::Sender<u64>,
    download_rate: watch::Receiver<Speed>,
    upload_rate: watch::Receiver<Speed>,
}

/// Processes commands and engine events one at a time until shutdown or
/// until every handle and event sender is gone.
///
/// Queued engine events are always drained before the next command, so a
/// command answer reflects every event sent before it.
async fn run_actor_loop(
    mut actor: SessionActor,
    mut receiver: mpsc::Receiver<SessionCommand>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    tracing::debug!(
        "Session actor started: {} pieces, {} bytes",
        actor.store.len(),
        actor.store.total_length()
    );

    loop {
        tokio::select! {
            biased;

            Some(event) = events.recv() => {
                actor.handle_event(event);
            }
            Some(command) = receiver.recv() => {
                if !actor.handle_command(command) {
                    break;
                }
            }
            else => break,
        }
    }

    tracing::debug!("Session actor stopped");
}

impl SessionActor {
    /// Returns false to stop the loop.
    fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::OpenFile {
                name,
                span,
                responder,
            } => {
                let result = self.open_file(name, span);
                let _ = responder.send(result);
            }

            SessionCommand::CloseFile { file_id, responder } => {
                let _ = responder.send(self.close_file(file_id));
            }

            SessionCommand::Stats { responder } => {
                let _ = responder.send(self.stats());
            }

            SessionCommand::Shutdown { responder } => {
                tracing::debug!("Session actor shutting down");
                let _ = responder.send(());
                return false;
            }
        }
        true
    }

    fn open_file(&mut self, name: String, span: ByteSpan) -> Result<FileHandle, SessionError> {
        if let Some(existing) = self.files.iter().find(|file| file.name() == name) {
            return Ok(existing.clone());
        }
        if self.store.pieces_in_span(span).is_none() {
            return Err(SessionError::InvalidFileSpan {
                offset: span.offset,
                length: span.length,
                total: self.store.total_length(),
            });
        }

        let id = self.next_file_id;
        self.next_file_id += 1;
        let sink = self.priorities.sink_for(id);
        let scheduler = match DownloadScheduler::for_span(
            Arc::clone(&self.store),
            span,
            sink,
            &self.config.scheduler,
        ) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                self.priorities.remove(id);
                return Err(e.into());
            }
        };
        let handle = FileHandle::new(
            id,
            Arc::from(name),
            span,
            Arc::clone(&self.store),
            Arc::clone(&self.content),
            Arc::new(scheduler),
            self.commands.clone(),
            self.config.streaming.read_ahead_bytes,
        );

        tracing::info!(
            "Opened file {} at bytes {}..{}",
            handle.name(),
            span.offset,
            span.end()
        );
        self.files.push(handle.clone());
        Ok(handle)
    }

    fn close_file(&mut self, file_id: u64) -> bool {
        let Some(position) = self.files.iter().position(|file| file.id() == file_id) else {
            return false;
        };
        let file = self.files.remove(position);
        self.priorities.remove(file_id);
        tracing::info!("Closed file {}", file.name());
        true
    }

    fn stats(&self) -> SessionStats {
        let files: Vec<FileStats> = self.files.iter().map(FileHandle::stats).collect();
        SessionStats::from_files(&files).with_transfer(
            *self.download_rate.borrow(),
            *self.uploaded.borrow(),
            *self.upload_rate.borrow(),
        )
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::PieceDownloaded { piece_index } => self.piece_downloaded(piece_index),

            EngineEvent::PieceDownloading { piece_index } => {
                match self.store.mark_downloading(piece_index) {
                    Ok(true) => tracing::trace!("Piece {} downloading", piece_index),
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Ignoring downloading event: {}", e),
                }
            }

            EngineEvent::TorrentChecked => {
                tracing::info!(
                    "Torrent checked: {}/{} pieces on disk",
                    self.store.finished_count(),
                    self.store.len()
                );
                // a recheck may reset piece priorities on the engine side
                for file in &self.files {
                    file.scheduler().on_torrent_resumed();
                }
            }

            EngineEvent::TorrentResumed => {
                for file in &self.files {
                    file.scheduler().on_torrent_resumed();
                }
            }

            EngineEvent::AllPiecesCached => {
                let newly = self.store.mark_all_finished();
                tracing::info!("All pieces cached ({} newly marked)", newly);
                for file in &self.files {
                    file.scheduler().on_all_requested_pieces_downloaded();
                }
            }

            EngineEvent::Counters {
                downloaded,
                uploaded,
            } => {
                self.downloaded.send_replace(downloaded);
                self.uploaded.send_replace(uploaded);
            }
        }
    }

    fn piece_downloaded(&self, index: PieceIndex) {
        if let Err(e) = self.store.mark_finished(index) {
            tracing::warn!("Ignoring completion event: {}", e);
            return;
        }

        let mut delivered = false;
        for file in &self.files {
            if file.scheduler().piece_range().contains(&index) {
                file.scheduler().on_piece_downloaded(index);
                delivered = true;
            }
        }
        if !delivered {
            tracing::trace!("Piece {} belongs to no opened file", index);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::scheduler::RecordingPrioritySink;
    use crate::streaming::MemoryContent;

    fn pieces(values: &[u32]) -> Vec<PieceIndex> {
        values.iter().copied().map(PieceIndex::new).collect()
    }

    fn session(total: u64, piece_size: u64) -> (SessionHandle, Arc<RecordingPrioritySink>) {
        let store = Arc::new(PieceStore::from_total_length(total, piece_size).unwrap());
        let content = Arc::new(MemoryContent::new(vec![7u8; total as usize]));
        let sink = Arc::new(RecordingPrioritySink::new());
        let mut config = PiecewiseConfig::for_testing();
        config.scheduler.header_size = piece_size;
        config.scheduler.footer_size = piece_size;
        let handle = spawn_session(store, content, sink.clone(), config);
        (handle, sink)
    }

    /// Round-trips a command; the actor drains queued events first.
    async fn settle(handle: &SessionHandle) -> SessionStats {
        handle.stats().await.unwrap()
    }

    #[tokio::test]
    async fn test_open_file_emits_metadata_priorities() {
        let (handle, sink) = session(10_000, 1000);
        let file = handle.open_file("movie.mkv", ByteSpan::new(0, 10_000)).await.unwrap();

        assert_eq!(file.name(), "movie.mkv");
        assert_eq!(sink.last(), Some(pieces(&[0, 9])));
    }

    #[tokio::test]
    async fn test_open_same_file_twice_reuses_scheduler() {
        let (handle, sink) = session(10_000, 1000);
        let first = handle.open_file("a", ByteSpan::new(0, 5000)).await.unwrap();
        let second = handle.open_file("a", ByteSpan::new(0, 5000)).await.unwrap();

        assert!(Arc::ptr_eq(first.scheduler(), second.scheduler()));
        assert_eq!(sink.call_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_file_span_rejected() {
        let (handle, _sink) = session(10_000, 1000);
        let result = handle.open_file("bad", ByteSpan::new(9000, 5000)).await;
        assert!(matches!(result, Err(SessionError::InvalidFileSpan { .. })));
    }

    #[tokio::test]
    async fn test_events_update_store_then_scheduler() {
        let (handle, sink) = session(10_000, 1000);
        let file = handle.open_file("movie.mkv", ByteSpan::new(0, 10_000)).await.unwrap();
        let events = handle.events();

        events.piece_downloading(PieceIndex::new(0)).unwrap();
        events.piece_downloaded(PieceIndex::new(0)).unwrap();
        events.piece_downloaded(PieceIndex::new(9)).unwrap();
        settle(&handle).await;

        assert!(handle.store().is_finished(PieceIndex::new(0)));
        assert_eq!(file.scheduler().downloading(), pieces(&[1, 2]));
        assert_eq!(sink.last(), Some(pieces(&[1, 2])));
    }

    #[tokio::test]
    async fn test_files_share_engine_priorities() {
        let (handle, sink) = session(10_000, 1000);
        handle.open_file("a", ByteSpan::new(0, 4000)).await.unwrap();
        handle.open_file("b", ByteSpan::new(4000, 6000)).await.unwrap();

        assert_eq!(sink.last(), Some(pieces(&[0, 3, 4, 9])));

        handle.events().piece_downloaded(PieceIndex::new(4)).unwrap();
        settle(&handle).await;
        assert_eq!(sink.last(), Some(pieces(&[0, 3, 9])));
    }

    #[tokio::test]
    async fn test_invalid_engine_index_is_ignored() {
        let (handle, sink) = session(4000, 1000);
        handle.open_file("a", ByteSpan::new(0, 4000)).await.unwrap();
        let before = sink.call_count();

        handle.events().piece_downloaded(PieceIndex::new(42)).unwrap();
        settle(&handle).await;

        assert_eq!(sink.call_count(), before);
    }

    #[tokio::test]
    async fn test_all_pieces_cached_finishes_schedulers() {
        let (handle, _sink) = session(8000, 1000);
        let file = handle.open_file("a", ByteSpan::new(0, 8000)).await.unwrap();

        handle.events().all_pieces_cached().unwrap();
        let stats = settle(&handle).await;

        assert!(file.scheduler().is_finished());
        assert_eq!(stats.downloaded_bytes, 8000);
        assert_eq!(stats.download_progress, 1.0);
    }

    #[tokio::test]
    async fn test_all_pieces_cached_during_sequential_finishes() {
        let (handle, sink) = session(10_000, 1000);
        let file = handle.open_file("a", ByteSpan::new(0, 10_000)).await.unwrap();
        handle.events().piece_downloaded(PieceIndex::new(0)).unwrap();
        handle.events().piece_downloaded(PieceIndex::new(9)).unwrap();
        settle(&handle).await;
        assert_eq!(file.scheduler().downloading(), pieces(&[1, 2]));

        handle.events().all_pieces_cached().unwrap();
        settle(&handle).await;

        assert!(file.scheduler().is_finished());
        assert_eq!(sink.last(), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_queued_events_apply_before_next_command() {
        let (handle, _sink) = session(64_000, 1000);
        let file = handle.open_file("a", ByteSpan::new(0, 64_000)).await.unwrap();
        let events = handle.events();

        for round in 1..=20u64 {
            for step in 0..50u64 {
                events.counters(round * 1000 + step, round * 100 + step).unwrap();
            }
            let stats = handle.stats().await.unwrap();
            assert_eq!(stats.uploaded_bytes, round * 100 + 49);
        }

        for i in 0..64 {
            events.piece_downloaded(PieceIndex::new(i)).unwrap();
        }
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.downloaded_bytes, 64_000);
        assert!(file.scheduler().is_finished());
    }

    #[tokio::test]
    async fn test_close_file_withdraws_its_priorities() {
        let (handle, sink) = session(10_000, 1000);
        let first = handle.open_file("a", ByteSpan::new(0, 4000)).await.unwrap();
        handle.open_file("b", ByteSpan::new(4000, 6000)).await.unwrap();
        assert_eq!(sink.last(), Some(pieces(&[0, 3, 4, 9])));

        first.close().await.unwrap();
        assert_eq!(sink.last(), Some(pieces(&[4, 9])));

        // the closed scheduler no longer reaches the engine
        let before = sink.call_count();
        first.scheduler().on_torrent_resumed();
        assert_eq!(sink.call_count(), before);
        first.close().await.unwrap();

        let reopened = handle.open_file("a", ByteSpan::new(0, 4000)).await.unwrap();
        assert!(!Arc::ptr_eq(first.scheduler(), reopened.scheduler()));
        assert_ne!(first.id(), reopened.id());
        assert_eq!(sink.last(), Some(pieces(&[0, 3, 4, 9])));
    }

    #[tokio::test]
    async fn test_pause_and_resume_file() {
        let (handle, sink) = session(10_000, 1000);
        let first = handle.open_file("a", ByteSpan::new(0, 4000)).await.unwrap();
        handle.open_file("b", ByteSpan::new(4000, 6000)).await.unwrap();

        first.pause();
        assert!(first.is_paused());
        assert_eq!(sink.last(), Some(pieces(&[4, 9])));

        first.resume();
        assert_eq!(sink.last(), Some(pieces(&[0, 3, 4, 9])));
    }

    #[tokio::test]
    async fn test_await_finished_resolves_when_cached() {
        let (handle, _sink) = session(6000, 1000);
        let file = handle.open_file("a", ByteSpan::new(0, 6000)).await.unwrap();

        let waiter = {
            let file = file.clone();
            tokio::spawn(async move { file.await_finished().await })
        };
        handle.events().all_pieces_cached().unwrap();

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("file never finished")
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_after_shutdown_reports_closed() {
        let (handle, _sink) = session(4000, 1000);
        let file = handle.open_file("a", ByteSpan::new(0, 4000)).await.unwrap();
        handle.shutdown().await.unwrap();

        assert!(matches!(file.close().await, Err(SessionError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_resumed_and_checked_reissue_priorities() {
        let (handle, sink) = session(8000, 1000);
        handle.open_file("a", ByteSpan::new(0, 8000)).await.unwrap();
        let before = sink.call_count();

        handle.events().torrent_resumed().unwrap();
        handle.events().torrent_checked().unwrap();
        settle(&handle).await;

        assert_eq!(sink.call_count(), before + 2);
        assert_eq!(sink.last(), Some(pieces(&[0, 7])));
    }

    #[tokio::test]
    async fn test_counters_feed_stats() {
        let (handle, _sink) = session(8000, 1000);
        handle.events().counters(4096, 1024).unwrap();

        let stats = settle(&handle).await;
        assert_eq!(stats.uploaded_bytes, 1024);

        let mut rate = handle.download_rate();
        let speed = tokio::time::timeout(
            Duration::from_secs(2),
            rate.wait_for(|speed| !speed.is_unspecified()),
        )
        .await
        .unwrap()
        .unwrap()
        .bytes_per_second();
        assert!(speed.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let (handle, _sink) = session(8000, 1000);
        handle.shutdown().await.unwrap();

        assert!(matches!(handle.stats().await, Err(SessionError::SessionClosed)));
        assert!(matches!(
            handle.events().torrent_resumed(),
            Err(SessionError::SessionClosed)
        ));
    }
}
