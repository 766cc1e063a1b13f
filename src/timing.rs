//! Timing policy: pure functions for durations, jitter, eager refresh and backoff,
//! plus the logical clock used to order entries across instances.

use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::options::BackoffPolicy;
use crate::utils::now_us;

/// Monotonic logical clock.
///
/// Timestamps follow wall-clock microseconds so that instances produce comparable
/// values, but never go backwards or repeat within a process. Timestamps seen from
/// other instances are fed back through [`observe`](Clock::observe), so a lagging
/// wall clock cannot order a new local write before a write it already knows about.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            last: AtomicI64::new(0),
        }
    }

    /// Next timestamp, strictly greater than any previously returned one.
    pub fn next(&self) -> i64 {
        let wall = now_us();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Advance past `timestamp` if it is ahead of this clock.
    pub fn observe(&self, timestamp: i64) {
        self.last.fetch_max(timestamp, Ordering::AcqRel);
    }
}

/// Convert a duration to whole milliseconds, saturating.
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Base duration plus a random amount in `[0, jitter_max]`.
pub fn with_jitter(duration: Duration, jitter_max: Option<Duration>) -> Duration {
    match jitter_max {
        Some(max) if !max.is_zero() => {
            let extra = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
            duration + Duration::from_millis(extra)
        }
        _ => duration,
    }
}

/// The point in time (unix ms) after which a fresh entry should be refreshed eagerly.
///
/// Returns `None` when the threshold is disabled or out of the open `(0, 1)` range.
pub fn eager_refresh_at(created_at: i64, duration_ms: i64, threshold: Option<f32>) -> Option<i64> {
    let threshold = threshold?;
    if threshold <= 0.0 || threshold >= 1.0 {
        return None;
    }
    Some(created_at + (duration_ms as f64 * threshold as f64) as i64)
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff_delay(policy: &BackoffPolicy, base: Duration, attempt: u32) -> Duration {
    match policy {
        BackoffPolicy::Fixed => base,
        BackoffPolicy::Exponential { max } => {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            base.checked_mul(factor).unwrap_or(*max).min(*max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_orders_after_observed_timestamps() {
        let clock = Clock::new();
        let first = clock.next();
        assert!(clock.next() > first);

        let remote = now_us() + 60_000_000;
        clock.observe(remote);
        assert!(clock.next() > remote);

        // Older timestamps do not move the clock back.
        clock.observe(first);
        assert!(clock.next() > remote);
    }

    #[test]
    fn test_clock_is_strictly_monotonic() {
        let clock = Clock::new();
        let mut prev = clock.next();
        for _ in 0..10_000 {
            let next = clock.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        assert_eq!(with_jitter(base, None), base);
        assert_eq!(with_jitter(base, Some(Duration::ZERO)), base);
        for _ in 0..100 {
            let d = with_jitter(base, Some(Duration::from_millis(500)));
            assert!(d >= base && d <= base + Duration::from_millis(500));
        }
    }

    #[test]
    fn test_eager_refresh_threshold() {
        assert_eq!(eager_refresh_at(1_000, 100, Some(0.8)), Some(1_080));
        assert_eq!(eager_refresh_at(1_000, 100, None), None);
        assert_eq!(eager_refresh_at(1_000, 100, Some(1.0)), None);
        assert_eq!(eager_refresh_at(1_000, 100, Some(0.0)), None);
    }

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(&BackoffPolicy::Fixed, base, 5), base);

        let policy = BackoffPolicy::Exponential {
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff_delay(&policy, base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, base, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&policy, base, 10), Duration::from_secs(1));
        assert_eq!(backoff_delay(&policy, base, 40), Duration::from_secs(1));
    }
}
