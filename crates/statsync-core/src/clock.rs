//! Wall-clock abstraction.
//!
//! Leases, budgets and queue delays are stored as absolute timestamps so that
//! every process sharing a store agrees on them. [`SystemClock`] reads the
//! system time; [`TokioClock`] follows tokio's clock, which lets tests drive
//! TTL expiry and refill windows with `tokio::time::pause`.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock anchored to a wall-clock instant and advanced by tokio's clock.
///
/// When tokio time is paused, this clock only moves when tokio time moves.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioClock {
    /// Creates a clock anchored at the current system time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        after(self.anchor_wall, self.anchor.elapsed())
    }
}

/// Converts a std duration into a chrono duration, saturating on overflow.
#[must_use]
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Returns `start + duration`, saturating at the maximum representable time.
#[must_use]
pub fn after(start: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    start
        .checked_add_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Returns the non-negative std duration from `now` until `deadline`.
#[must_use]
pub fn until(now: DateTime<Utc>, deadline: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let start = clock.now();

        tokio::time::sleep(Duration::from_secs(90)).await;

        let elapsed = clock.now() - start;
        assert_eq!(elapsed.num_seconds(), 90);
    }

    #[test]
    fn until_is_zero_for_past_deadlines() {
        let now = Utc::now();
        assert_eq!(until(now, now - chrono::Duration::seconds(5)), Duration::ZERO);
        assert_eq!(
            until(now, now + chrono::Duration::milliseconds(250)),
            Duration::from_millis(250)
        );
    }
}
