//! Scheduler state machine.
//!
//! Every transition is a pure function from the current state to the next
//! one. `None` means the event did not change anything, so the caller must
//! not re-issue priorities.

use std::collections::BTreeSet;

use crate::pieces::PieceIndex;

/// Fixed parameters of the sequential phase, derived once from the file span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequentialPlan {
    /// First piece after the header region
    pub start_index: PieceIndex,
    /// Last piece before the footer region
    pub last_index: PieceIndex,
    /// Maximum pieces downloading at once
    pub window_size: u32,
}

/// Sliding window over the pieces between header and footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequentialWindow {
    pub start_index: PieceIndex,
    pub last_index: PieceIndex,
    pub window_size: u32,
    pub window_start: PieceIndex,
    pub window_end: PieceIndex,
    /// Pieces currently marked top priority, never including completed ones
    pub downloading: BTreeSet<PieceIndex>,
    /// Pieces a seek jumped over that are still missing
    pub skipped: BTreeSet<PieceIndex>,
}

impl SequentialWindow {
    fn plan(&self) -> SequentialPlan {
        SequentialPlan {
            start_index: self.start_index,
            last_index: self.last_index,
            window_size: self.window_size,
        }
    }
}

/// Current phase of a download scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerState {
    /// Fetching header and footer pieces so the player can parse the container.
    /// `seek` is a middle piece a reader is already blocked on; it is fetched
    /// alongside and the first window starts there.
    Metadata {
        requested: BTreeSet<PieceIndex>,
        seek: Option<PieceIndex>,
    },
    /// Downloading a bounded window just ahead of playback
    Sequential(SequentialWindow),
    /// Every scheduled piece is done
    Finished,
}

impl SchedulerState {
    /// Starts in `Metadata`, or skips straight ahead when resume data already
    /// covers every header and footer piece.
    pub(crate) fn initial(
        mut requested: BTreeSet<PieceIndex>,
        plan: Option<SequentialPlan>,
        done: &dyn Fn(PieceIndex) -> bool,
    ) -> Self {
        requested.retain(|&index| !done(index));
        if requested.is_empty() {
            Self::enter_sequential(plan, None, done)
        } else {
            SchedulerState::Metadata {
                requested,
                seek: None,
            }
        }
    }

    /// Opens the first window at `plan.start_index`, or at `seek` when a
    /// reader asked for a later piece, in which case the pieces before it
    /// are revisited at the end.
    pub(crate) fn enter_sequential(
        plan: Option<SequentialPlan>,
        seek: Option<PieceIndex>,
        done: &dyn Fn(PieceIndex) -> bool,
    ) -> Self {
        let Some(plan) = plan else {
            return SchedulerState::Finished;
        };
        let from = seek
            .filter(|index| (plan.start_index..=plan.last_index).contains(index))
            .unwrap_or(plan.start_index);
        let skipped = (plan.start_index.as_u32()..from.as_u32())
            .map(PieceIndex::new)
            .collect();
        Self::window_from(plan, from, skipped, done)
    }

    /// Builds the window beginning at the first missing piece at or after
    /// `from`. Once the end is passed, pieces skipped by earlier seeks are
    /// revisited before declaring the download finished.
    fn window_from(
        plan: SequentialPlan,
        from: PieceIndex,
        skipped: BTreeSet<PieceIndex>,
        done: &dyn Fn(PieceIndex) -> bool,
    ) -> Self {
        let mut skipped: BTreeSet<PieceIndex> =
            skipped.into_iter().filter(|&index| !done(index)).collect();
        let mut start = from.as_u32();

        loop {
            while start <= plan.last_index.as_u32() && done(PieceIndex::new(start)) {
                start += 1;
            }
            if start <= plan.last_index.as_u32() {
                break;
            }
            match skipped.pop_first() {
                Some(first_missing) => {
                    start = first_missing.as_u32();
                    skipped.clear();
                }
                None => return SchedulerState::Finished,
            }
        }

        let end = start
            .saturating_add(plan.window_size.max(1) - 1)
            .min(plan.last_index.as_u32());
        let downloading = (start..=end)
            .map(PieceIndex::new)
            .filter(|&index| !done(index))
            .collect();
        skipped.retain(|index| index.as_u32() < start);

        SchedulerState::Sequential(SequentialWindow {
            start_index: plan.start_index,
            last_index: plan.last_index,
            window_size: plan.window_size,
            window_start: PieceIndex::new(start),
            window_end: PieceIndex::new(end),
            downloading,
            skipped,
        })
    }

    /// Reacts to a completed piece. `index` must already count as done.
    pub(crate) fn after_piece_downloaded(
        &self,
        index: PieceIndex,
        plan: Option<SequentialPlan>,
        done: &dyn Fn(PieceIndex) -> bool,
    ) -> Option<Self> {
        match self {
            SchedulerState::Metadata { requested, seek } => {
                if !requested.contains(&index) && *seek != Some(index) {
                    return None;
                }
                let mut remaining = requested.clone();
                remaining.retain(|&piece| piece != index && !done(piece));
                if remaining.is_empty() {
                    Some(Self::enter_sequential(plan, *seek, done))
                } else {
                    // the reader moves on; its next wait re-anchors the seek
                    Some(SchedulerState::Metadata {
                        requested: remaining,
                        seek: seek.filter(|&piece| piece != index),
                    })
                }
            }
            SchedulerState::Sequential(window) => {
                if !window.downloading.contains(&index) {
                    if !window.skipped.contains(&index) {
                        return None;
                    }
                    let mut next = window.clone();
                    next.skipped.remove(&index);
                    return Some(SchedulerState::Sequential(next));
                }

                let was_head = window.downloading.first() == Some(&index);
                let mut remaining = window.downloading.clone();
                remaining.remove(&index);

                if was_head || remaining.is_empty() {
                    let next_start = remaining
                        .first()
                        .copied()
                        .unwrap_or_else(|| window.window_end.next());
                    Some(Self::window_from(
                        window.plan(),
                        next_start,
                        window.skipped.clone(),
                        done,
                    ))
                } else {
                    // A piece behind the head arrived first: keep bandwidth on
                    // the head, do not slide the window.
                    let mut next = window.clone();
                    next.downloading = remaining;
                    Some(SchedulerState::Sequential(next))
                }
            }
            SchedulerState::Finished => None,
        }
    }

    /// Completes every outstanding metadata piece at once. In `Sequential`
    /// the window is rebuilt against `done`, so content that finished behind
    /// the scheduler's back resolves to `Finished`.
    pub(crate) fn after_all_requested_downloaded(
        &self,
        plan: Option<SequentialPlan>,
        done: &dyn Fn(PieceIndex) -> bool,
    ) -> Option<Self> {
        match self {
            SchedulerState::Metadata { seek, .. } => {
                Some(Self::enter_sequential(plan, *seek, done))
            }
            SchedulerState::Sequential(window) => {
                let next = Self::window_from(
                    window.plan(),
                    window.window_start,
                    window.skipped.clone(),
                    done,
                );
                (next != *self).then_some(next)
            }
            SchedulerState::Finished => None,
        }
    }

    /// Moves priority to a piece the reader is blocked on. In `Metadata` the
    /// piece is fetched next to the boundary pieces; in `Sequential` the
    /// window restarts there.
    pub(crate) fn after_seek(
        &self,
        index: PieceIndex,
        plan: Option<SequentialPlan>,
        done: &dyn Fn(PieceIndex) -> bool,
    ) -> Option<Self> {
        let window = match self {
            SchedulerState::Metadata { requested, seek } => {
                let plan = plan?;
                if index < plan.start_index
                    || index > plan.last_index
                    || requested.contains(&index)
                    || *seek == Some(index)
                    || done(index)
                {
                    return None;
                }
                return Some(SchedulerState::Metadata {
                    requested: requested.clone(),
                    seek: Some(index),
                });
            }
            SchedulerState::Sequential(window) => window,
            SchedulerState::Finished => return None,
        };
        if index < window.start_index
            || index > window.last_index
            || window.downloading.contains(&index)
            || done(index)
        {
            return None;
        }

        let mut skipped = window.skipped.clone();
        skipped.extend((window.window_start.as_u32()..index.as_u32()).map(PieceIndex::new));
        skipped.retain(|&piece| piece < index);

        Some(Self::window_from(window.plan(), index, skipped, done))
    }

    /// Pieces that should be top priority in this state.
    pub fn priorities(&self) -> Vec<PieceIndex> {
        match self {
            SchedulerState::Metadata { requested, seek } => {
                let mut pieces: BTreeSet<PieceIndex> = requested.clone();
                pieces.extend(*seek);
                pieces.into_iter().collect()
            }
            SchedulerState::Sequential(window) => window.downloading.iter().copied().collect(),
            SchedulerState::Finished => Vec::new(),
        }
    }

    pub fn is_downloading(&self, index: PieceIndex) -> bool {
        match self {
            SchedulerState::Metadata { requested, seek } => {
                requested.contains(&index) || *seek == Some(index)
            }
            SchedulerState::Sequential(window) => window.downloading.contains(&index),
            SchedulerState::Finished => false,
        }
    }

    /// Short phase name for logging.
    pub fn phase(&self) -> &'static str {
        match self {
            SchedulerState::Metadata { .. } => "metadata",
            SchedulerState::Sequential(_) => "sequential",
            SchedulerState::Finished => "finished",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn idx(values: &[u32]) -> BTreeSet<PieceIndex> {
        values.iter().copied().map(PieceIndex::new).collect()
    }

    fn plan(start: u32, last: u32, window_size: u32) -> Option<SequentialPlan> {
        Some(SequentialPlan {
            start_index: PieceIndex::new(start),
            last_index: PieceIndex::new(last),
            window_size,
        })
    }

    fn window(state: &SchedulerState) -> &SequentialWindow {
        match state {
            SchedulerState::Sequential(window) => window,
            other => panic!("expected sequential state, got {other:?}"),
        }
    }

    fn none_done(_: PieceIndex) -> bool {
        false
    }

    #[test]
    fn test_initial_state_requests_metadata() {
        let state = SchedulerState::initial(idx(&[0, 1, 9]), plan(2, 8, 2), &none_done);
        assert_eq!(
            state,
            SchedulerState::Metadata {
                requested: idx(&[0, 1, 9]),
                seek: None,
            }
        );
    }

    #[test]
    fn test_initial_state_skips_metadata_when_resumed() {
        let done = |index: PieceIndex| index.as_u32() != 3;
        let state = SchedulerState::initial(idx(&[0, 1, 9]), plan(2, 8, 2), &done);

        let window = window(&state);
        assert_eq!(window.window_start, PieceIndex::new(3));
        assert_eq!(window.downloading, idx(&[3]));
    }

    #[test]
    fn test_metadata_ignores_unrequested_piece() {
        let state = SchedulerState::initial(idx(&[0, 9]), plan(1, 8, 2), &none_done);
        assert!(state.after_piece_downloaded(PieceIndex::new(4), plan(1, 8, 2), &none_done).is_none());
    }

    #[test]
    fn test_metadata_without_middle_finishes() {
        let state = SchedulerState::initial(idx(&[0, 1]), None, &none_done);
        let done = |index: PieceIndex| index.as_u32() == 0;
        let state = state
            .after_piece_downloaded(PieceIndex::new(0), None, &done)
            .unwrap();
        let done = |index: PieceIndex| index.as_u32() <= 1;
        let state = state
            .after_piece_downloaded(PieceIndex::new(1), None, &done)
            .unwrap();
        assert_eq!(state, SchedulerState::Finished);
    }

    #[test]
    fn test_non_head_completion_keeps_window() {
        let state = SchedulerState::enter_sequential(plan(4, 9, 3), None, &none_done);
        let done = |index: PieceIndex| index.as_u32() == 5;
        let next = state
            .after_piece_downloaded(PieceIndex::new(5), plan(4, 9, 3), &done)
            .unwrap();

        let window = window(&next);
        assert_eq!(window.window_start, PieceIndex::new(4));
        assert_eq!(window.window_end, PieceIndex::new(6));
        assert_eq!(window.downloading, idx(&[4, 6]));
    }

    #[test]
    fn test_head_completion_skips_pieces_finished_out_of_order() {
        let state = SchedulerState::enter_sequential(plan(4, 12, 4), None, &none_done);
        let finished: HashSet<u32> = [6].into_iter().collect();
        let done = |index: PieceIndex| finished.contains(&index.as_u32());
        let state = state
            .after_piece_downloaded(PieceIndex::new(6), plan(4, 12, 4), &done)
            .unwrap();

        let finished: HashSet<u32> = [4, 6].into_iter().collect();
        let done = |index: PieceIndex| finished.contains(&index.as_u32());
        let state = state
            .after_piece_downloaded(PieceIndex::new(4), plan(4, 12, 4), &done)
            .unwrap();

        let window = window(&state);
        assert_eq!(window.window_start, PieceIndex::new(5));
        assert_eq!(window.window_end, PieceIndex::new(8));
        assert_eq!(window.downloading, idx(&[5, 7, 8]));
    }

    #[test]
    fn test_seek_forward_then_revisit_skipped() {
        let state = SchedulerState::enter_sequential(plan(2, 9, 2), None, &none_done);
        let state = state
            .after_seek(PieceIndex::new(7), plan(2, 9, 2), &none_done)
            .unwrap();
        {
            let window = window(&state);
            assert_eq!(window.downloading, idx(&[7, 8]));
            assert_eq!(window.skipped, idx(&[2, 3, 4, 5, 6]));
        }

        let finished: HashSet<u32> = [7].into_iter().collect();
        let done = |index: PieceIndex| finished.contains(&index.as_u32());
        let state = state
            .after_piece_downloaded(PieceIndex::new(7), plan(2, 9, 2), &done)
            .unwrap();
        assert_eq!(window(&state).downloading, idx(&[8, 9]));

        let finished: HashSet<u32> = [7, 8, 9].into_iter().collect();
        let done = |index: PieceIndex| finished.contains(&index.as_u32());
        let state = state
            .after_piece_downloaded(PieceIndex::new(8), plan(2, 9, 2), &done)
            .unwrap();

        // 9 was already done, so the window wraps back to the first skipped piece
        let window = window(&state);
        assert_eq!(window.window_start, PieceIndex::new(2));
        assert_eq!(window.downloading, idx(&[2, 3]));
        assert!(window.skipped.is_empty());
    }

    #[test]
    fn test_seek_ignored_outside_plan_range() {
        let state = SchedulerState::enter_sequential(plan(2, 9, 2), None, &none_done);
        assert!(state.after_seek(PieceIndex::new(1), plan(2, 9, 2), &none_done).is_none());
        assert!(state.after_seek(PieceIndex::new(10), plan(2, 9, 2), &none_done).is_none());
        assert!(state.after_seek(PieceIndex::new(3), plan(2, 9, 2), &none_done).is_none());

        let metadata = SchedulerState::initial(idx(&[0]), plan(2, 9, 2), &none_done);
        assert!(metadata.after_seek(PieceIndex::new(0), plan(2, 9, 2), &none_done).is_none());
        assert!(metadata.after_seek(PieceIndex::new(11), plan(2, 9, 2), &none_done).is_none());
        assert!(metadata.after_seek(PieceIndex::new(5), None, &none_done).is_none());
    }

    #[test]
    fn test_seek_during_metadata_anchors_first_window() {
        let state = SchedulerState::initial(idx(&[0, 9]), plan(1, 8, 2), &none_done);
        let state = state
            .after_seek(PieceIndex::new(5), plan(1, 8, 2), &none_done)
            .unwrap();
        assert_eq!(state.priorities(), idx(&[0, 5, 9]).into_iter().collect::<Vec<_>>());
        assert!(state.is_downloading(PieceIndex::new(5)));
        assert!(state.after_seek(PieceIndex::new(5), plan(1, 8, 2), &none_done).is_none());

        let done = |index: PieceIndex| index.as_u32() == 0;
        let state = state
            .after_piece_downloaded(PieceIndex::new(0), plan(1, 8, 2), &done)
            .unwrap();
        let done = |index: PieceIndex| [0, 9].contains(&index.as_u32());
        let state = state
            .after_piece_downloaded(PieceIndex::new(9), plan(1, 8, 2), &done)
            .unwrap();

        let window = window(&state);
        assert_eq!(window.window_start, PieceIndex::new(5));
        assert_eq!(window.downloading, idx(&[5, 6]));
        assert_eq!(window.skipped, idx(&[1, 2, 3, 4]));
    }

    #[test]
    fn test_seek_piece_finished_during_metadata_drops_from_priorities() {
        let state = SchedulerState::initial(idx(&[0, 9]), plan(1, 8, 2), &none_done);
        let state = state
            .after_seek(PieceIndex::new(4), plan(1, 8, 2), &none_done)
            .unwrap();

        let done = |index: PieceIndex| index.as_u32() == 4;
        let state = state
            .after_piece_downloaded(PieceIndex::new(4), plan(1, 8, 2), &done)
            .unwrap();
        assert_eq!(
            state,
            SchedulerState::Metadata {
                requested: idx(&[0, 9]),
                seek: None,
            }
        );
    }

    #[test]
    fn test_all_requested_in_sequential_rebuilds_from_done() {
        let state = SchedulerState::enter_sequential(plan(1, 8, 2), None, &none_done);
        assert!(state.after_all_requested_downloaded(plan(1, 8, 2), &none_done).is_none());

        let done = |index: PieceIndex| index.as_u32() <= 3;
        let next = state
            .after_all_requested_downloaded(plan(1, 8, 2), &done)
            .unwrap();
        assert_eq!(window(&next).downloading, idx(&[4, 5]));

        let all_done = |_: PieceIndex| true;
        let next = state
            .after_all_requested_downloaded(plan(1, 8, 2), &all_done)
            .unwrap();
        assert_eq!(next, SchedulerState::Finished);
    }

    #[test]
    fn test_skipped_completion_keeps_priorities() {
        let state = SchedulerState::enter_sequential(plan(2, 9, 2), None, &none_done);
        let state = state
            .after_seek(PieceIndex::new(7), plan(2, 9, 2), &none_done)
            .unwrap();

        let done = |index: PieceIndex| index.as_u32() == 3;
        let next = state
            .after_piece_downloaded(PieceIndex::new(3), plan(2, 9, 2), &done)
            .unwrap();

        assert_eq!(next.priorities(), state.priorities());
        assert_eq!(window(&next).skipped, idx(&[2, 4, 5, 6]));
    }

    #[test]
    fn test_finished_is_terminal() {
        let state = SchedulerState::Finished;
        assert!(state.after_piece_downloaded(PieceIndex::new(1), plan(0, 3, 2), &none_done).is_none());
        assert!(state.after_all_requested_downloaded(plan(0, 3, 2), &none_done).is_none());
        assert!(state.priorities().is_empty());
        assert_eq!(state.phase(), "finished");
    }
}
