//! Sliding-window throughput estimate over cumulative byte counters

/// Number of samples the averager keeps.
pub const RATE_WINDOW: usize = 5;

/// Smooths a cumulative counter over the last [`RATE_WINDOW`] ticks.
///
/// Each tick pushes the counter's current total. The rate is the growth
/// between the oldest and newest retained sample, divided by the number of
/// samples retained, so a single burst is spread over several ticks.
#[derive(Debug, Clone, Default)]
pub struct RateAverager {
    samples: [u64; RATE_WINDOW],
    next: usize,
    seen: u64,
}

impl RateAverager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the counter's current cumulative value, overwriting the oldest
    /// sample once the window is full.
    pub fn push(&mut self, total: u64) {
        self.samples[self.next] = total;
        self.next = (self.next + 1) % RATE_WINDOW;
        self.seen += 1;
    }

    /// Samples currently in the window.
    pub fn len(&self) -> usize {
        self.seen.min(RATE_WINDOW as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.seen == 0
    }

    /// Average growth per tick, or 0 with fewer than two samples.
    pub fn rate(&self) -> u64 {
        let count = self.len();
        if count < 2 {
            return 0;
        }

        let newest = self.samples[(self.next + RATE_WINDOW - 1) % RATE_WINDOW];
        let oldest = if count < RATE_WINDOW {
            self.samples[0]
        } else {
            self.samples[self.next]
        };
        // counters are monotonic; a reset upstream reads as no progress
        newest.saturating_sub(oldest) / count as u64
    }
}
