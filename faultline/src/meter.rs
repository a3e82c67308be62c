//! Byte and packet counters with rate reporting.
//!
//! Meters are updated on the reactor thread and read from any thread, so
//! all state is atomic. A period reset racing an update may attribute that
//! update to either period; totals are always exact.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;

/// Count accumulated over an elapsed span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateMeterPeriod {
    count: u64,
    elapsed: Duration,
}

impl RateMeterPeriod {
    /// Creates a period snapshot.
    #[must_use]
    pub const fn new(count: u64, elapsed: Duration) -> Self {
        Self { count, elapsed }
    }

    /// Number of units counted during the period.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Length of the period.
    #[must_use]
    pub const fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Units per second. `NaN` for an empty zero-length period.
    #[must_use]
    pub fn rate_per_sec(&self) -> f64 {
        self.rate_per(Duration::from_secs(1))
    }

    /// Units per `unit` of time. `NaN` for an empty zero-length period.
    #[must_use]
    pub fn rate_per(&self, unit: Duration) -> f64 {
        self.count as f64 * unit.as_secs_f64() / self.elapsed.as_secs_f64()
    }
}

impl std::fmt::Display for RateMeterPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} in {}ms ({:.1}/sec)",
            self.count,
            self.elapsed.as_millis(),
            self.rate_per_sec()
        )
    }
}

/// Monotonic counter with a resettable period.
#[derive(Debug)]
pub struct RateMeter {
    created: Instant,
    total: AtomicU64,
    period_count: AtomicU64,
    /// Start of the current period, in nanoseconds after `created`.
    period_start_ns: AtomicU64,
}

impl RateMeter {
    /// Creates a meter whose clock starts now.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Creates a meter whose clock starts at `created`.
    #[must_use]
    pub fn starting_at(created: Instant) -> Self {
        Self {
            created,
            total: AtomicU64::new(0),
            period_count: AtomicU64::new(0),
            period_start_ns: AtomicU64::new(0),
        }
    }

    /// Adds `delta` units.
    pub fn update(&self, delta: u64) {
        self.total.fetch_add(delta, Ordering::Relaxed);
        self.period_count.fetch_add(delta, Ordering::Relaxed);
    }

    /// Total units since creation.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Totals since creation, measured now.
    #[must_use]
    pub fn total(&self) -> RateMeterPeriod {
        self.total_at(Instant::now())
    }

    /// Totals since creation, measured at `now`.
    #[must_use]
    pub fn total_at(&self, now: Instant) -> RateMeterPeriod {
        RateMeterPeriod::new(self.total_count(), self.since_created(now))
    }

    /// Units since the last period reset, measured now.
    pub fn period(&self, reset: bool) -> RateMeterPeriod {
        self.period_at(Instant::now(), reset)
    }

    /// Units since the last period reset, measured at `now`. With `reset`,
    /// a new period starts at `now`.
    pub fn period_at(&self, now: Instant, reset: bool) -> RateMeterPeriod {
        let now_ns = duration_ns(self.since_created(now));
        let (count, start_ns) = if reset {
            (
                self.period_count.swap(0, Ordering::Relaxed),
                self.period_start_ns.swap(now_ns, Ordering::Relaxed),
            )
        } else {
            (
                self.period_count.load(Ordering::Relaxed),
                self.period_start_ns.load(Ordering::Relaxed),
            )
        };
        RateMeterPeriod::new(count, Duration::from_nanos(now_ns.saturating_sub(start_ns)))
    }

    fn since_created(&self, now: Instant) -> Duration {
        now.checked_duration_since(self.created).unwrap_or_default()
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Read/sent meter pair for one side of a relay.
#[derive(Debug, Clone, Default)]
pub struct RateMeters {
    /// Units received from the socket.
    pub read: Arc<RateMeter>,
    /// Units written to the socket.
    pub sent: Arc<RateMeter>,
}

impl RateMeters {
    /// Creates a fresh pair of meters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_rates() {
        let p = RateMeterPeriod::new(5000, Duration::from_secs(1));

        assert_eq!(p.count(), 5000);
        assert_eq!(p.elapsed(), Duration::from_millis(1000));
        assert!((p.rate_per_sec() - 5000.0).abs() < 0.1);
        assert!((p.rate_per(Duration::from_millis(1)) - 5.0).abs() < 0.1);
        assert!((p.rate_per(Duration::from_micros(1)) - 0.005).abs() < 0.0001);
        assert!((p.rate_per(Duration::from_secs(60)) - 300_000.0).abs() < 0.1);
    }

    #[test]
    fn empty_period_rate_is_nan() {
        assert!(RateMeterPeriod::new(0, Duration::ZERO).rate_per_sec().is_nan());
    }

    #[test]
    fn total_and_period_reset() {
        let t0 = Instant::now();
        let meter = RateMeter::starting_at(t0);
        meter.update(100);

        let t1 = t0 + Duration::from_secs(1);

        assert_eq!(meter.total_count(), 100);
        let total = meter.total_at(t1);
        assert_eq!(total.count(), 100);
        assert_eq!(total.elapsed(), Duration::from_secs(1));
        assert!((total.rate_per_sec() - 100.0).abs() < 0.1);
        assert!((total.rate_per(Duration::from_millis(1)) - 0.1).abs() < 0.01);

        let period = meter.period_at(t1, true);
        assert_eq!(period.count(), 100);
        assert_eq!(period.elapsed(), Duration::from_secs(1));

        let period = meter.period_at(t1, true);
        assert_eq!(period.count(), 0);
        assert_eq!(period.elapsed(), Duration::ZERO);
        assert!(period.rate_per_sec().is_nan());

        // Totals are unaffected by period resets.
        assert_eq!(meter.total_at(t1).count(), 100);
    }

    #[test]
    fn period_without_reset_keeps_accumulating() {
        let t0 = Instant::now();
        let meter = RateMeter::starting_at(t0);
        meter.update(10);
        let _ = meter.period_at(t0 + Duration::from_millis(10), false);
        meter.update(5);

        let period = meter.period_at(t0 + Duration::from_millis(20), false);
        assert_eq!(period.count(), 15);
        assert_eq!(period.elapsed(), Duration::from_millis(20));
    }
}
