//! Shared rate streams fed by cumulative byte counters

use std::time::Duration;

use tokio::sync::watch;

use super::{RateAverager, Speed};

/// Spawns one task that samples `counter` every `tick` and publishes the
/// averaged speed.
///
/// All subscribers share the returned receiver's computation; clone it to
/// subscribe again. The stream reads `Unspecified` until two samples exist.
/// The task ends when the counter's sender is dropped or every speed
/// receiver is gone.
pub fn spawn_rate_stream(
    mut counter: watch::Receiver<u64>,
    tick: Duration,
) -> watch::Receiver<Speed> {
    let (sender, receiver) = watch::channel(Speed::Unspecified);
    let tick = tick.max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut averager = RateAverager::new();
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sender.closed() => {
                    tracing::trace!("Rate stream has no subscribers left");
                    break;
                }
                _ = interval.tick() => {
                    if counter.has_changed().is_err() {
                        tracing::trace!("Rate stream counter closed");
                        break;
                    }
                    averager.push(*counter.borrow_and_update());
                    if averager.len() >= 2 {
                        sender.send_replace(Speed::BytesPerSecond(per_second(averager.rate(), tick)));
                    }
                }
            }
        }
    });

    receiver
}

fn per_second(per_tick: u64, tick: Duration) -> u64 {
    let micros = tick.as_micros().max(1);
    let value = u128::from(per_tick) * 1_000_000 / micros;
    u64::try_from(value).unwrap_or(u64::MAX)
}
