//! Transfer statistics: rate smoothing, per-file and per-session totals,
//! and shared rate streams.

pub mod aggregate;
pub mod rate_averager;
pub mod stream;

pub use aggregate::{FileStats, SessionStats, Speed};
pub use rate_averager::{RATE_WINDOW, RateAverager};
pub use stream::spawn_rate_stream;
