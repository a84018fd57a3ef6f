//! Piece prioritization for streaming playback.
//!
//! The scheduler first pulls the header and footer of a file so a player can
//! parse container metadata, then keeps a small window of pieces downloading
//! just ahead of the playback position. It never requests the whole file at
//! once. Decisions leave through a [`PrioritySink`] as a complete
//! "download only these pieces" set.

pub mod state;

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

pub use state::{SchedulerState, SequentialPlan, SequentialWindow};

use crate::config::SchedulerConfig;
use crate::pieces::{ByteSpan, PieceError, PieceIndex, PieceStore};

/// Outbound priority commands to the torrent engine.
///
/// Implementations must not block: calls are made while the scheduler lock
/// is held.
pub trait PrioritySink: Send + Sync {
    /// Sets exactly `pieces` to highest priority and every other piece to
    /// the lowest.
    fn download_only(&self, pieces: &[PieceIndex]);
}

/// Priority command forwarded to the native engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorityCommand {
    DownloadOnly(Vec<PieceIndex>),
}

/// Priority sink that forwards commands over a channel to whatever drives
/// the native engine.
#[derive(Debug, Clone)]
pub struct PriorityChannel {
    sender: mpsc::UnboundedSender<PriorityCommand>,
}

impl PriorityChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PriorityCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl PrioritySink for PriorityChannel {
    fn download_only(&self, pieces: &[PieceIndex]) {
        if self
            .sender
            .send(PriorityCommand::DownloadOnly(pieces.to_vec()))
            .is_err()
        {
            tracing::warn!("Priority receiver dropped, discarding {} pieces", pieces.len());
        }
    }
}

/// Priority sink that remembers every call. Used by tests and the simulator.
#[derive(Debug, Default)]
pub struct RecordingPrioritySink {
    calls: Mutex<Vec<Vec<PieceIndex>>>,
}

impl RecordingPrioritySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls in order.
    pub fn calls(&self) -> Vec<Vec<PieceIndex>> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Most recent priority set, if any.
    pub fn last(&self) -> Option<Vec<PieceIndex>> {
        self.calls.lock().last().cloned()
    }
}

impl PrioritySink for RecordingPrioritySink {
    fn download_only(&self, pieces: &[PieceIndex]) {
        self.calls.lock().push(pieces.to_vec());
    }
}

struct SchedulerInner {
    state: SchedulerState,
    /// Completions delivered to this scheduler, indexed by piece
    completed: Vec<bool>,
    /// Priorities withheld from the sink
    paused: bool,
}

/// Decides which pieces of one file span are top priority.
///
/// Every entry point takes the same lock, because completion events arrive
/// from the engine event loop while resume and seek requests come from other
/// tasks. The lock is never held across an await point.
pub struct DownloadScheduler {
    store: Arc<PieceStore>,
    sink: Arc<dyn PrioritySink>,
    span: ByteSpan,
    piece_range: RangeInclusive<PieceIndex>,
    plan: Option<SequentialPlan>,
    inner: Mutex<SchedulerInner>,
    finished: watch::Sender<bool>,
}

impl DownloadScheduler {
    /// Schedules the whole content of `store`.
    pub fn new(
        store: Arc<PieceStore>,
        sink: Arc<dyn PrioritySink>,
        config: &SchedulerConfig,
    ) -> Self {
        let span = ByteSpan::new(0, store.total_length());
        let piece_range = store.first().index..=store.last().index;
        Self::build(store, span, piece_range, sink, config)
    }

    /// Schedules one file occupying `span` of the concatenated content.
    ///
    /// # Errors
    ///
    /// - `PieceError::InvalidSpan` - If `span` is empty or runs past the content
    pub fn for_span(
        store: Arc<PieceStore>,
        span: ByteSpan,
        sink: Arc<dyn PrioritySink>,
        config: &SchedulerConfig,
    ) -> Result<Self, PieceError> {
        let piece_range = store
            .pieces_in_span(span)
            .ok_or(PieceError::InvalidSpan {
                offset: span.offset,
                length: span.length,
                total: store.total_length(),
            })?;
        Ok(Self::build(store, span, piece_range, sink, config))
    }

    fn build(
        store: Arc<PieceStore>,
        span: ByteSpan,
        piece_range: RangeInclusive<PieceIndex>,
        sink: Arc<dyn PrioritySink>,
        config: &SchedulerConfig,
    ) -> Self {
        let header = boundary_pieces(&store, span, config.header_size, Boundary::Header);
        let footer = boundary_pieces(&store, span, config.footer_size, Boundary::Footer);

        let start_index = header
            .as_ref()
            .map(|range| range.end().next())
            .unwrap_or(*piece_range.start());
        // The first footer piece is already requested, so the sequential
        // range stops right before it.
        let last_index = match &footer {
            Some(range) => range.start().as_u32().checked_sub(1).map(PieceIndex::new),
            None => Some(*piece_range.end()),
        };
        let window_size = config.window_size_for(store.nominal_piece_size());
        let plan = last_index
            .filter(|&last| start_index <= last)
            .map(|last_index| SequentialPlan {
                start_index,
                last_index,
                window_size,
            });

        let requested: BTreeSet<PieceIndex> = header
            .into_iter()
            .chain(footer)
            .flat_map(|range| (range.start().as_u32()..=range.end().as_u32()).map(PieceIndex::new))
            .collect();

        let completed: Vec<bool> = store
            .iter()
            .map(|piece| store.is_finished(piece.index))
            .collect();
        let state = SchedulerState::initial(requested, plan, &|index| {
            completed.get(index.as_usize()).copied().unwrap_or(false)
        });

        tracing::info!(
            "Scheduler for bytes {}..{} (pieces {}..={}) starts in {} phase, plan {:?}",
            span.offset,
            span.end(),
            piece_range.start(),
            piece_range.end(),
            state.phase(),
            plan
        );
        sink.download_only(&state.priorities());
        let (finished, _) = watch::channel(matches!(state, SchedulerState::Finished));

        Self {
            store,
            sink,
            span,
            piece_range,
            plan,
            inner: Mutex::new(SchedulerInner {
                state,
                completed,
                paused: false,
            }),
            finished,
        }
    }

    /// Records a completed piece and moves the window if the head advanced.
    pub fn on_piece_downloaded(&self, index: PieceIndex) {
        if !self.piece_range.contains(&index) {
            tracing::trace!("Piece {} outside scheduler range, ignored", index);
            return;
        }

        let mut inner = self.inner.lock();
        let SchedulerInner {
            state,
            completed,
            paused,
        } = &mut *inner;
        if let Some(slot) = completed.get_mut(index.as_usize()) {
            *slot = true;
        }

        let completed: &[bool] = completed;
        let store = &self.store;
        let done = |piece: PieceIndex| is_done(completed, store, piece);
        let next = state.after_piece_downloaded(index, self.plan, &done);
        if let Some(next) = next {
            tracing::debug!("Piece {} completed, scheduler advances", index);
            self.apply(state, *paused, next);
        }
    }

    /// Completes every outstanding metadata piece at once, for content that
    /// is already fully cached. Past the metadata phase the window is
    /// rebuilt from what the store holds.
    pub fn on_all_requested_pieces_downloaded(&self) {
        let mut inner = self.inner.lock();
        let SchedulerInner {
            state,
            completed,
            paused,
        } = &mut *inner;
        if let SchedulerState::Metadata { requested, .. } = &*state {
            for index in requested {
                if let Some(slot) = completed.get_mut(index.as_usize()) {
                    *slot = true;
                }
            }
        }

        let completed: &[bool] = completed;
        let store = &self.store;
        let done = |piece: PieceIndex| is_done(completed, store, piece);
        let next = state.after_all_requested_downloaded(self.plan, &done);
        if let Some(next) = next {
            self.apply(state, *paused, next);
        }
    }

    /// Re-issues the current priority set. The engine may drop priority
    /// flags across a pause or restart.
    pub fn on_torrent_resumed(&self) {
        let inner = self.inner.lock();
        let priorities = effective_priorities(&inner);
        tracing::debug!("Torrent resumed, re-issuing {} priorities", priorities.len());
        self.sink.download_only(&priorities);
    }

    /// Moves priority to a piece a reader is blocked on. Returns whether
    /// the priority set changed.
    pub fn on_seek(&self, index: PieceIndex) -> bool {
        let mut inner = self.inner.lock();
        let SchedulerInner {
            state,
            completed,
            paused,
        } = &mut *inner;

        let completed: &[bool] = completed;
        let store = &self.store;
        let done = |piece: PieceIndex| is_done(completed, store, piece);
        match state.after_seek(index, self.plan, &done) {
            Some(next) => {
                tracing::info!("Reader waiting on piece {}, moving priority there", index);
                self.apply(state, *paused, next)
            }
            None => false,
        }
    }

    /// Withdraws every priority of this scheduler until [`resume`]. Piece
    /// completions are still tracked meanwhile.
    ///
    /// [`resume`]: DownloadScheduler::resume
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.paused {
            return;
        }
        inner.paused = true;
        tracing::debug!("Scheduler for bytes {}..{} paused", self.span.offset, self.span.end());
        self.sink.download_only(&[]);
    }

    /// Re-issues the current priority set after [`pause`].
    ///
    /// [`pause`]: DownloadScheduler::pause
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            return;
        }
        inner.paused = false;
        tracing::debug!("Scheduler for bytes {}..{} resumed", self.span.offset, self.span.end());
        self.sink.download_only(&inner.state.priorities());
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Resolves once the scheduler reaches `Finished`. Cancel-safe.
    pub async fn wait_finished(&self) {
        let mut finished = self.finished.subscribe();
        // the sender lives in `self`, so the channel cannot close here
        let _ = finished.wait_for(|finished| *finished).await;
    }

    /// Installs `next` and forwards its priorities if they differ from the
    /// current ones. Returns whether they differed.
    fn apply(&self, state: &mut SchedulerState, paused: bool, next: SchedulerState) -> bool {
        if state.phase() != next.phase() {
            tracing::info!("Scheduler phase {} -> {}", state.phase(), next.phase());
        }
        let priorities = next.priorities();
        let changed = priorities != state.priorities();
        *state = next;

        if matches!(state, SchedulerState::Finished) {
            self.finished.send_replace(true);
        }
        if changed && !paused {
            self.sink.download_only(&priorities);
        }
        changed
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> SchedulerState {
        self.inner.lock().state.clone()
    }

    /// Pieces currently marked top priority.
    pub fn downloading(&self) -> Vec<PieceIndex> {
        self.inner.lock().state.priorities()
    }

    pub fn is_downloading(&self, index: PieceIndex) -> bool {
        self.inner.lock().state.is_downloading(index)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.inner.lock().state, SchedulerState::Finished)
    }

    pub fn piece_range(&self) -> RangeInclusive<PieceIndex> {
        self.piece_range.clone()
    }

    pub fn span(&self) -> ByteSpan {
        self.span
    }

    pub fn plan(&self) -> Option<SequentialPlan> {
        self.plan
    }
}

fn effective_priorities(inner: &SchedulerInner) -> Vec<PieceIndex> {
    if inner.paused {
        Vec::new()
    } else {
        inner.state.priorities()
    }
}

fn is_done(completed: &[bool], store: &PieceStore, index: PieceIndex) -> bool {
    completed.get(index.as_usize()).copied().unwrap_or(false) || store.is_finished(index)
}

#[derive(Clone, Copy)]
enum Boundary {
    Header,
    Footer,
}

/// Pieces intersecting the first or last `size` bytes of `span`.
fn boundary_pieces(
    store: &PieceStore,
    span: ByteSpan,
    size: u64,
    boundary: Boundary,
) -> Option<RangeInclusive<PieceIndex>> {
    let length = size.min(span.length);
    let region = match boundary {
        Boundary::Header => ByteSpan::new(span.offset, length),
        Boundary::Footer => ByteSpan::new(span.end() - length, length),
    };
    store.pieces_in_span(region)
}
