//! Merges per-file priority sets into one command for the engine.
//!
//! Each file's scheduler believes it owns the whole priority table. The
//! engine only has one, so every update re-sends the union of the latest set
//! from each open file. Closing a file drops its set; later updates from its
//! scheduler are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::pieces::PieceIndex;
use crate::scheduler::PrioritySink;

pub(crate) struct PriorityUnion {
    outer: Arc<dyn PrioritySink>,
    sets: Mutex<BTreeMap<u64, Vec<PieceIndex>>>,
}

impl PriorityUnion {
    pub(crate) fn new(outer: Arc<dyn PrioritySink>) -> Arc<Self> {
        Arc::new(Self {
            outer,
            sets: Mutex::new(BTreeMap::new()),
        })
    }

    /// Registers `file` and returns its sink. Ids must not be reused.
    pub(crate) fn sink_for(self: &Arc<Self>, file: u64) -> Arc<dyn PrioritySink> {
        self.sets.lock().insert(file, Vec::new());
        Arc::new(FilePrioritySink {
            file,
            union: Arc::clone(self),
        })
    }

    /// Drops `file`'s set and re-sends the union if it held any pieces.
    pub(crate) fn remove(&self, file: u64) {
        let mut sets = self.sets.lock();
        let Some(previous) = sets.remove(&file) else {
            return;
        };
        if !previous.is_empty() {
            self.forward(&sets);
        }
    }

    fn update(&self, file: u64, pieces: &[PieceIndex]) {
        // held while forwarding so the engine sees updates in lock order
        let mut sets = self.sets.lock();
        let Some(set) = sets.get_mut(&file) else {
            tracing::trace!("Priorities from closed file {} dropped", file);
            return;
        };
        *set = pieces.to_vec();
        tracing::trace!("File {} priorities {:?}", file, pieces);
        self.forward(&sets);
    }

    fn forward(&self, sets: &BTreeMap<u64, Vec<PieceIndex>>) {
        let union: BTreeSet<PieceIndex> = sets.values().flatten().copied().collect();
        let union: Vec<PieceIndex> = union.into_iter().collect();
        tracing::trace!("Engine priority set {:?}", union);
        self.outer.download_only(&union);
    }
}

struct FilePrioritySink {
    file: u64,
    union: Arc<PriorityUnion>,
}

impl PrioritySink for FilePrioritySink {
    fn download_only(&self, pieces: &[PieceIndex]) {
        self.union.update(self.file, pieces);
    }
}
