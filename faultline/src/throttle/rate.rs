//! Rate throttlers over a virtual release clock.
//!
//! Each throttler keeps a `horizon`: the instant at which everything it has
//! admitted so far would have been released at exactly the target rate. A
//! chunk of `n` units pushes the horizon forward by `n * period / rate`, and
//! its delay is whatever remains between now and the new horizon. After an
//! idle gap the horizon is pulled up to at most one period behind `now`, so
//! the burst allowance after idling is one period's worth of units.

use std::time::Duration;

use minstant::Instant;

use super::Throttler;

#[derive(Debug)]
struct RateClock {
    rate: u64,
    period: Duration,
    horizon: Instant,
}

impl RateClock {
    fn new(rate: u64, period: Duration, now: Instant) -> Self {
        assert!(rate > 0, "rate must be > 0");
        assert!(!period.is_zero(), "period must be > 0");
        Self {
            rate,
            period,
            horizon: now,
        }
    }

    fn admit(&mut self, now: Instant, units: u64) -> Duration {
        if now.checked_duration_since(self.horizon).unwrap_or_default() > self.period {
            self.horizon = now - self.period;
        }

        let cost_ns = u128::from(units) * self.period.as_nanos() / u128::from(self.rate);
        let cost_ns = u64::try_from(cost_ns).unwrap_or(u64::MAX);
        self.horizon = self.horizon + Duration::from_nanos(cost_ns);

        self.horizon.checked_duration_since(now).unwrap_or_default()
    }
}

/// Limits throughput to `rate` bytes per `period`.
#[derive(Debug)]
pub struct ByteRateThrottler {
    clock: RateClock,
}

impl ByteRateThrottler {
    /// Creates a throttler allowing `rate` bytes per `period`, starting now.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero or `period` is zero.
    #[must_use]
    pub fn new(rate: u64, period: Duration) -> Self {
        Self::starting_at(rate, period, Instant::now())
    }

    /// Creates a throttler whose accounting starts at `now`.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero or `period` is zero.
    #[must_use]
    pub fn starting_at(rate: u64, period: Duration, now: Instant) -> Self {
        Self {
            clock: RateClock::new(rate, period, now),
        }
    }

    /// Convenience constructor for a bytes-per-second limit.
    #[must_use]
    pub fn per_second(rate: u64) -> Self {
        Self::new(rate, Duration::from_secs(1))
    }
}

impl Throttler for ByteRateThrottler {
    fn delay(&mut self, now: Instant, data: &[u8]) -> Duration {
        self.clock.admit(now, data.len() as u64)
    }
}

/// Limits throughput to `rate` chunks (datagrams or buffer slots) per `period`.
#[derive(Debug)]
pub struct PacketRateThrottler {
    clock: RateClock,
}

impl PacketRateThrottler {
    /// Creates a throttler allowing `rate` packets per `period`, starting now.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero or `period` is zero.
    #[must_use]
    pub fn new(rate: u64, period: Duration) -> Self {
        Self::starting_at(rate, period, Instant::now())
    }

    /// Creates a throttler whose accounting starts at `now`.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is zero or `period` is zero.
    #[must_use]
    pub fn starting_at(rate: u64, period: Duration, now: Instant) -> Self {
        Self {
            clock: RateClock::new(rate, period, now),
        }
    }

    /// Convenience constructor for a packets-per-second limit.
    #[must_use]
    pub fn per_second(rate: u64) -> Self {
        Self::new(rate, Duration::from_secs(1))
    }
}

impl Throttler for PacketRateThrottler {
    fn delay(&mut self, now: Instant, _data: &[u8]) -> Duration {
        self.clock.admit(now, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Drives `throttler` with random chunk sizes and gaps, honoring every
    /// returned delay, and returns the achieved rate in units per second.
    fn simulate<T: Throttler>(
        throttler: &mut T,
        start: Instant,
        mut units_of: impl FnMut(usize) -> u64,
    ) -> f64 {
        let mut rng = StdRng::seed_from_u64(1);
        let stub = [0u8; 100];
        let mut now = start;
        let mut total_units = 0u64;

        for _ in 0..10_000 {
            let size = rng.gen_range(0..100);
            now = now + Duration::from_nanos(rng.gen_range(0..100_000));
            let delay = throttler.delay(now, &stub[..size]);
            now = now + delay;
            total_units += units_of(size);
        }

        total_units as f64 / now.duration_since(start).as_secs_f64()
    }

    #[test]
    fn byte_rate_converges() {
        let start = Instant::now();
        let mut throttler = ByteRateThrottler::starting_at(1000, Duration::from_secs(1), start);

        let rate = simulate(&mut throttler, start, |size| size as u64);
        assert!((rate - 1000.0).abs() < 10.0, "rate {rate}");
    }

    #[test]
    fn packet_rate_converges() {
        let start = Instant::now();
        let mut throttler = PacketRateThrottler::starting_at(10, Duration::from_secs(1), start);

        let rate = simulate(&mut throttler, start, |_| 1);
        assert!((rate - 10.0).abs() < 0.1, "rate {rate}");
    }

    #[test]
    fn small_byte_rate_counts_from_creation() {
        let start = Instant::now();
        // 1 byte per 100 seconds
        let mut throttler = ByteRateThrottler::starting_at(1, Duration::from_secs(100), start);

        let delay = throttler.delay(start + Duration::from_secs(1), &[0u8]);
        assert_eq!(delay, Duration::from_secs(99));
    }

    #[test]
    fn small_packet_rate_counts_from_creation() {
        let start = Instant::now();
        let mut throttler = PacketRateThrottler::starting_at(1, Duration::from_secs(100), start);

        let delay = throttler.delay(start + Duration::from_secs(1), &[]);
        assert_eq!(delay, Duration::from_secs(99));
    }

    #[test]
    fn idle_gap_allows_one_period_of_burst() {
        let start = Instant::now();
        let mut throttler = ByteRateThrottler::starting_at(1000, Duration::from_secs(1), start);

        let later = start + Duration::from_secs(60);
        assert_eq!(throttler.delay(later, &[0u8; 1000]), Duration::ZERO);
        assert_eq!(
            throttler.delay(later, &[0u8; 500]),
            Duration::from_millis(500)
        );
    }

    #[test]
    #[should_panic(expected = "rate must be > 0")]
    fn zero_rate_panics() {
        let _ = ByteRateThrottler::per_second(0);
    }
}
