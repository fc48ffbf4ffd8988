//! Clock abstraction for the scheduler and lifecycle timestamps.
//!
//! Every "now" in the service comes from a [`Clock`] so tests can move time
//! past a 20 minute verification window or a 3 day reminder without
//! sleeping.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Source of wall-clock and monotonic time.
///
/// Production code uses [`RealClock`]; tests inject [`TestClock`].
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current monotonic instant, for measuring durations.
    fn now(&self) -> Instant;

    /// Current wall-clock time, for persisted timestamps and `fire_at`
    /// comparisons.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for `duration`.
    ///
    /// The test clock advances itself instead of waiting.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// System clock backed by tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time, so a clock handed to the engine
/// can be advanced from the test body.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Microseconds elapsed since creation.
    elapsed_us: Arc<AtomicI64>,
    /// Wall-clock time in microseconds since the UNIX epoch.
    wall_us: Arc<AtomicI64>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at `start`.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self {
            elapsed_us: Arc::new(AtomicI64::new(0)),
            wall_us: Arc::new(AtomicI64::new(start.timestamp_micros())),
            base_instant: Instant::now(),
        }
    }

    /// Moves both monotonic and wall-clock time forward.
    pub fn advance(&self, duration: Duration) {
        let us = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        self.elapsed_us.fetch_add(us, Ordering::AcqRel);
        self.wall_us.fetch_add(us, Ordering::AcqRel);
    }

    /// Time advanced since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.elapsed_us.load(Ordering::Acquire).unsigned_abs())
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let us = self.wall_us.load(Ordering::Acquire);
        DateTime::<Utc>::from_timestamp_micros(us).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn fixed_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn advance_moves_both_clocks() {
        let clock = TestClock::with_start_time(fixed_start());
        let start = clock.now();

        clock.advance(Duration::from_secs(20 * 60));

        assert_eq!(clock.now().duration_since(start), Duration::from_secs(20 * 60));
        assert_eq!(clock.now_utc(), fixed_start() + chrono::Duration::minutes(20));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::with_start_time(fixed_start());
        let handle = clock.clone();

        handle.advance(Duration::from_secs(86_400));

        assert_eq!(clock.now_utc(), fixed_start() + chrono::Duration::days(1));
    }

    #[tokio::test]
    async fn sleep_advances_instead_of_waiting() {
        let clock = TestClock::with_start_time(fixed_start());

        clock.sleep(Duration::from_secs(3 * 86_400)).await;

        assert_eq!(clock.now_utc(), fixed_start() + chrono::Duration::days(3));
    }
}
