//! Interval clock.
//!
//! Boundaries are fixed offsets from one anchor (`anchor + k * interval`),
//! so time spent inside a cycle never accumulates into drift. With
//! wall-clock alignment the anchor is the next multiple of the interval
//! since the Unix epoch, matching the market's five-minute windows.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::shutdown::Shutdown;

/// One scheduled interval boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Boundary index since the clock's anchor.
    pub index: u64,
    pub scheduled_at: DateTime<Utc>,
    pub instant: Instant,
    /// Boundaries passed over because they were missed by more than the
    /// grace period.
    pub missed: u64,
}

impl Tick {
    /// When the interval opened by this tick closes.
    pub fn closes_at(&self, interval: Duration) -> (DateTime<Utc>, Instant) {
        let wall = self.scheduled_at
            + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero());
        (wall, self.instant + interval)
    }
}

/// The next multiple of `interval` at or after `now`.
pub fn aligned_anchor(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval.as_millis().max(1) as i64;
    let ms = now.timestamp_millis();
    let aligned = ms.div_euclid(step) * step;
    let aligned = if aligned < ms { aligned + step } else { aligned };
    DateTime::<Utc>::from_timestamp_millis(aligned).unwrap_or(now)
}

pub struct CycleClock {
    interval: Duration,
    grace: Duration,
    anchor_wall: DateTime<Utc>,
    anchor_instant: Instant,
    next_index: u64,
}

impl CycleClock {
    /// Anchor at the current time, or at the next aligned boundary.
    pub fn new(interval: Duration, grace: Duration, align_to_wall_clock: bool) -> Self {
        let now_wall = Utc::now();
        let now = Instant::now();
        let anchor_wall = if align_to_wall_clock {
            aligned_anchor(now_wall, interval)
        } else {
            now_wall
        };
        let offset = (anchor_wall - now_wall).to_std().unwrap_or(Duration::ZERO);
        Self::starting_at(anchor_wall, now + offset, interval, grace)
    }

    pub fn starting_at(
        anchor_wall: DateTime<Utc>,
        anchor_instant: Instant,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            grace,
            anchor_wall,
            anchor_instant,
            next_index: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn boundary(&self, index: u64) -> (DateTime<Utc>, Instant) {
        let offset = self.interval.saturating_mul(index.min(u32::MAX as u64) as u32);
        let wall = self.anchor_wall
            + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero());
        (wall, self.anchor_instant + offset)
    }

    /// The next boundary that is not already missed by more than the grace.
    pub fn next_tick(&self, now: Instant) -> Tick {
        let elapsed = now.saturating_duration_since(self.anchor_instant);
        let mut index = self.next_index;
        if elapsed > self.grace {
            let late = (elapsed - self.grace).as_nanos();
            let step = self.interval.as_nanos();
            let earliest = late.div_ceil(step) as u64;
            index = index.max(earliest);
        }
        let (scheduled_at, instant) = self.boundary(index);
        Tick {
            index,
            scheduled_at,
            instant,
            missed: index - self.next_index,
        }
    }

    /// Sleep until the next boundary. `None` on shutdown.
    pub async fn wait(&mut self, shutdown: &mut Shutdown) -> Option<Tick> {
        let tick = self.next_tick(Instant::now());
        if tick.missed > 0 {
            warn!(
                missed = tick.missed,
                next = %tick.scheduled_at.format("%H:%M:%S"),
                "Interval boundary missed beyond grace, skipping ahead"
            );
        }
        debug!(index = tick.index, at = %tick.scheduled_at.format("%H:%M:%S"), "Awaiting interval");
        tokio::select! {
            _ = tokio::time::sleep_until(tick.instant) => {}
            _ = shutdown.wait() => return None,
        }
        self.next_index = tick.index + 1;
        Some(tick)
    }
}
