//! Tick cadence for the polling loop.

use std::time::Duration;

use chrono::{Local, NaiveTime, Timelike};
use clap::ValueEnum;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Cadence {
    /// Sleep a full interval after each tick; latency accumulates.
    Sleep,
    /// Tick `k` is due at `start + k * interval`; only the residual is slept.
    #[default]
    Absolute,
    /// Tick on wall-clock multiples of the interval.
    Aligned,
}

#[derive(Debug, Clone)]
pub struct TickSchedule {
    cadence: Cadence,
    interval: Duration,
    next: Instant,
    skipped: u64,
}

impl TickSchedule {
    /// `start` is the instant of tick zero.
    pub fn new(cadence: Cadence, interval: Duration, start: Instant) -> Self {
        TickSchedule {
            cadence,
            interval,
            next: start,
            skipped: 0,
        }
    }

    /// Deadline of the next tick, given that the current one finished at `now`.
    pub fn next_deadline(&mut self, now: Instant) -> Instant {
        self.next_deadline_at(now, Local::now().time())
    }

    /// As [`next_deadline`](Self::next_deadline) with an explicit wall-clock time of day.
    pub fn next_deadline_at(&mut self, now: Instant, wall: NaiveTime) -> Instant {
        match self.cadence {
            Cadence::Sleep => now + self.interval,
            Cadence::Absolute => {
                self.next += self.interval;
                // Drop whole slots lost to an overrun, keep the grid.
                while self.next + self.interval <= now {
                    self.next += self.interval;
                    self.skipped += 1;
                }
                self.next
            }
            Cadence::Aligned => now + aligned_residual(wall, self.interval),
        }
    }

    /// Slots dropped so far under [`Cadence::Absolute`].
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

/// Time from `wall` until the next time of day that is a multiple of `interval`.
///
/// Never zero: a tick that lands exactly on a boundary waits a full interval.
pub fn aligned_residual(wall: NaiveTime, interval: Duration) -> Duration {
    let interval_ms = interval.as_millis().max(1);
    let elapsed_ms = u128::from(wall.num_seconds_from_midnight()) * 1000
        + u128::from(wall.nanosecond() / 1_000_000);
    let residual = interval_ms - elapsed_ms % interval_ms;
    Duration::from_millis(u64::try_from(residual).unwrap_or(u64::MAX))
}
