//! End-to-end tests: engine events -> piece store -> scheduler -> reader.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use piecewise_core::config::PiecewiseConfig;
use piecewise_core::pieces::{ByteSpan, PieceIndex, PieceStore};
use piecewise_core::scheduler::{PrioritySink, RecordingPrioritySink, SchedulerState};
use piecewise_core::streaming::{ContentSource, FileContent, MemoryContent};
use piecewise_core::{SessionHandle, StreamingError, spawn_session};
use tempfile::NamedTempFile;

const PIECE: u64 = 1000;

fn pieces(values: &[u32]) -> Vec<PieceIndex> {
    values.iter().copied().map(PieceIndex::new).collect()
}

fn content_of(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn config(boundary: u64, window: u32) -> PiecewiseConfig {
    let mut config = PiecewiseConfig::for_testing();
    config.scheduler.header_size = boundary;
    config.scheduler.footer_size = boundary;
    config.scheduler.window_size = Some(window);
    config
}

fn start_session(
    store: PieceStore,
    content: Arc<dyn ContentSource>,
    config: PiecewiseConfig,
) -> (SessionHandle, Arc<RecordingPrioritySink>) {
    let sink = Arc::new(RecordingPrioritySink::new());
    let handle = spawn_session(
        Arc::new(store),
        content,
        Arc::clone(&sink) as Arc<dyn PrioritySink>,
        config,
    );
    (handle, sink)
}

async fn complete(handle: &SessionHandle, indices: impl IntoIterator<Item = u32>) {
    let events = handle.events();
    for i in indices {
        events.piece_downloaded(PieceIndex::new(i)).unwrap();
    }
    // the actor drains queued events before answering a command
    handle.stats().await.unwrap();
}

#[tokio::test]
async fn test_fourteen_piece_scenario_through_session() {
    let total = 14 * PIECE;
    let store = PieceStore::from_total_length(total, PIECE).unwrap();
    let content = Arc::new(MemoryContent::new(content_of(total)));
    let (handle, sink) = start_session(store, content, config(4 * PIECE, 2));
    let file = handle
        .open_file("episode.mkv", ByteSpan::new(0, total))
        .await
        .unwrap();

    assert_eq!(
        file.scheduler().downloading(),
        pieces(&[0, 1, 2, 3, 10, 11, 12, 13])
    );

    complete(&handle, [0, 1, 2, 3, 10, 11, 12, 13]).await;
    match file.scheduler().snapshot() {
        SchedulerState::Sequential(window) => {
            assert_eq!(window.start_index, PieceIndex::new(4));
            assert_eq!(window.last_index, PieceIndex::new(9));
        }
        other => panic!("expected sequential state, got {other:?}"),
    }
    assert_eq!(sink.last(), Some(pieces(&[4, 5])));

    complete(&handle, [5, 4]).await;
    assert_eq!(sink.last(), Some(pieces(&[6, 7])));

    complete(&handle, 6..=9).await;
    assert!(file.scheduler().is_finished());
    assert_eq!(sink.last(), Some(Vec::new()));

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.downloaded_bytes, total);
    assert_eq!(stats.download_progress, 1.0);
}

#[tokio::test]
async fn test_reader_blocks_until_engine_delivers_piece() {
    let total = 6 * PIECE;
    let data = content_of(total);
    let store = PieceStore::from_total_length(total, PIECE).unwrap();
    let content = Arc::new(MemoryContent::new(data.clone()));
    let (handle, _sink) = start_session(store, content, config(PIECE, 2));
    let file = handle
        .open_file("clip.mp4", ByteSpan::new(0, total))
        .await
        .unwrap();

    let reader = tokio::spawn(async move {
        let mut source = file.open_source().unwrap();
        source.seek(2 * PIECE + 10).await.unwrap();
        let mut buf = vec![0u8; 2 * PIECE as usize];
        let length = buf.len();
        let read = source.read(&mut buf, 0, length).await.unwrap();
        buf.truncate(read);
        buf
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!reader.is_finished());

    complete(&handle, [2]).await;
    let bytes = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("reader never woke up")
        .unwrap();

    // one read stops at the piece boundary
    assert_eq!(bytes.len(), PIECE as usize - 10);
    assert_eq!(bytes, data[2010..3000]);
}

#[tokio::test]
async fn test_blocked_reader_pulls_window_forward() {
    let total = 20 * PIECE;
    let store = PieceStore::from_total_length(total, PIECE).unwrap();
    let content = Arc::new(MemoryContent::new(content_of(total)));
    let (handle, sink) = start_session(store, content, config(PIECE, 3));
    let file = handle
        .open_file("movie.mkv", ByteSpan::new(0, total))
        .await
        .unwrap();
    complete(&handle, [0, 19]).await;
    assert_eq!(sink.last(), Some(pieces(&[1, 2, 3])));

    let mut source = file.open_source().unwrap();
    let seek = tokio::time::timeout(Duration::from_millis(50), source.seek(12 * PIECE)).await;
    assert!(seek.is_err(), "piece 12 is not downloaded yet");

    assert_eq!(sink.last(), Some(pieces(&[12, 13, 14])));

    // the jumped-over pieces come back once the tail is done
    complete(&handle, [12, 13, 14, 15, 16, 17, 18]).await;
    assert_eq!(sink.last(), Some(pieces(&[1, 2, 3])));
}

#[tokio::test]
async fn test_reader_blocked_during_metadata_gets_first_window() {
    let total = 20 * PIECE;
    let data = content_of(total);
    let store = PieceStore::from_total_length(total, PIECE).unwrap();
    let content = Arc::new(MemoryContent::new(data.clone()));
    let (handle, sink) = start_session(store, content, config(PIECE, 3));
    let file = handle
        .open_file("movie.mkv", ByteSpan::new(0, total))
        .await
        .unwrap();
    assert_eq!(sink.last(), Some(pieces(&[0, 19])));

    let reader = tokio::spawn(async move {
        let mut source = file.open_source().unwrap();
        source.seek(12 * PIECE).await.unwrap();
        let mut buf = vec![0u8; PIECE as usize];
        let read = source.read(&mut buf, 0, PIECE as usize).await.unwrap();
        buf.truncate(read);
        (buf, file)
    });

    let wanted = tokio::time::timeout(Duration::from_secs(2), async {
        while sink.last() != Some(pieces(&[0, 12, 19])) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(wanted.is_ok(), "blocked piece was never requested");

    complete(&handle, [0, 19]).await;
    assert_eq!(sink.last(), Some(pieces(&[12, 13, 14])));

    complete(&handle, [12]).await;
    let (bytes, file) = tokio::time::timeout(Duration::from_secs(2), reader)
        .await
        .expect("reader never woke up")
        .unwrap();
    assert_eq!(bytes, data[12_000..13_000]);
    assert_eq!(file.scheduler().downloading(), pieces(&[13, 14, 15]));
}

#[tokio::test]
async fn test_resume_data_skips_finished_pieces() {
    let total = 10 * PIECE;
    let store = PieceStore::from_total_length(total, PIECE).unwrap();
    store
        .apply_resume_data([0, 1, 2, 9].map(PieceIndex::new))
        .unwrap();
    let content = Arc::new(MemoryContent::new(content_of(total)));
    let (handle, sink) = start_session(store, content, config(PIECE, 2));

    let file = handle
        .open_file("resumed.mkv", ByteSpan::new(0, total))
        .await
        .unwrap();

    assert_eq!(sink.calls(), vec![pieces(&[3, 4])]);
    assert!((file.stats().progress - 0.4).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_multi_file_torrent_reads_second_file_from_disk() {
    // file A: bytes 0..2500, file B: bytes 2500..7000
    let total = 7 * PIECE;
    let data = content_of(total);
    let mut on_disk = NamedTempFile::new().unwrap();
    on_disk.write_all(&data[2500..]).unwrap();
    on_disk.flush().unwrap();

    let content = Arc::new(FileContent::open(on_disk.path(), 2500).await.unwrap());
    let store = PieceStore::from_total_length(total, PIECE).unwrap();
    let (handle, _sink) = start_session(store, content, config(PIECE, 2));
    let file_b = handle
        .open_file("b.mkv", ByteSpan::new(2500, 4500))
        .await
        .unwrap();
    assert_eq!(
        file_b.scheduler().piece_range(),
        PieceIndex::new(2)..=PieceIndex::new(6)
    );

    handle.events().all_pieces_cached().unwrap();
    handle.stats().await.unwrap();

    let mut source = file_b.open_source().unwrap();
    assert_eq!(source.size(), 4500);
    let bytes = source.read_to_end().await.unwrap();
    assert_eq!(bytes, data[2500..]);
    assert!(file_b.scheduler().is_finished());
}

#[tokio::test]
async fn test_out_of_range_seek_is_an_error() {
    let total = 3 * PIECE;
    let store = PieceStore::from_total_length(total, PIECE).unwrap();
    let content = Arc::new(MemoryContent::new(content_of(total)));
    let (handle, _sink) = start_session(store, content, config(PIECE, 2));
    let file = handle
        .open_file("short.mkv", ByteSpan::new(0, total))
        .await
        .unwrap();

    let mut source = file.open_source().unwrap();
    let result = source.seek(total).await;
    assert!(matches!(
        result,
        Err(StreamingError::OffsetOutOfRange { offset, size }) if offset == total && size == total
    ));
}
