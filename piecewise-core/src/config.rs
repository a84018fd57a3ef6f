//! Centralized configuration for Piecewise.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the scheduler, stats and session code.

use std::time::Duration;

/// Central configuration for all Piecewise components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct PiecewiseConfig {
    pub scheduler: SchedulerConfig,
    pub stats: StatsConfig,
    pub session: SessionConfig,
    pub streaming: StreamingConfig,
}

/// Download scheduling parameters.
///
/// Header and footer sizes describe how much of each end of a media file a
/// player typically needs before it can start decoding.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Bytes at the start of a file fetched first
    pub header_size: u64,
    /// Bytes at the end of a file fetched first
    pub footer_size: u64,
    /// Target bytes kept in flight by the sequential window
    pub window_bytes: u64,
    /// Lower bound on the window, in pieces
    pub min_window: u32,
    /// Upper bound on the window, in pieces. The engine may spread requests
    /// across the whole window, so it must stay small.
    pub max_window: u32,
    /// Fixed window size in pieces, overriding `window_bytes`
    pub window_size: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            header_size: 2 * 1024 * 1024, // 2 MiB
            footer_size: 512 * 1024,      // 512 KiB
            window_bytes: 8 * 1024 * 1024, // 8 MiB
            min_window: 2,
            max_window: 64,
            window_size: None,
        }
    }
}

impl SchedulerConfig {
    /// Window size in pieces for the given nominal piece size.
    pub fn window_size_for(&self, piece_size: u64) -> u32 {
        if let Some(size) = self.window_size {
            return size.max(1);
        }
        let pieces = self.window_bytes / piece_size.max(1);
        let pieces = u32::try_from(pieces).unwrap_or(u32::MAX);
        pieces.clamp(self.min_window, self.max_window.max(self.min_window))
    }
}

/// Transfer statistics parameters.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Interval between byte-counter samples fed to the rate averager
    pub tick_interval: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Session actor parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the session command channel
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_buffer: 100,
        }
    }
}

/// Reader parameters.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Bytes of adjacent finished pieces a reader pulls from the content
    /// source in one go. Zero reads exactly what each call asks for.
    pub read_ahead_bytes: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            read_ahead_bytes: 4 * 1024 * 1024, // 4 MiB
        }
    }
}

impl PiecewiseConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(bytes) = env_u64("PIECEWISE_HEADER_SIZE") {
            config.scheduler.header_size = bytes;
        }

        if let Some(bytes) = env_u64("PIECEWISE_FOOTER_SIZE") {
            config.scheduler.footer_size = bytes;
        }

        if let Some(pieces) = env_u64("PIECEWISE_WINDOW_SIZE") {
            config.scheduler.window_size = u32::try_from(pieces).ok();
        }

        if let Some(millis) = env_u64("PIECEWISE_STATS_TICK_MS") {
            if millis > 0 {
                config.stats.tick_interval = Duration::from_millis(millis);
            }
        }

        if let Some(bytes) = env_u64("PIECEWISE_READ_AHEAD_BYTES") {
            config.streaming.read_ahead_bytes = bytes;
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Tiny header/footer regions and a two-piece window keep scenarios small
    /// enough to enumerate by hand; stats tick quickly.
    pub fn for_testing() -> Self {
        Self {
            scheduler: SchedulerConfig {
                header_size: 1024,
                footer_size: 1024,
                window_size: Some(2),
                ..Default::default()
            },
            stats: StatsConfig {
                tick_interval: Duration::from_millis(10),
            },
            session: SessionConfig::default(),
            streaming: StreamingConfig {
                read_ahead_bytes: 4096,
            },
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}
