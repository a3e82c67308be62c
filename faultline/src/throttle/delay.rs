//! Fixed-latency throttler.

use std::time::Duration;

use minstant::Instant;
use rand::Rng;

use super::Throttler;

/// Delays every chunk by a fixed amount, optionally jittered.
///
/// Chunks are still released in arrival order: a chunk drawing a short
/// jittered delay waits behind an earlier chunk that drew a long one.
#[derive(Debug, Clone, Copy)]
pub struct DelayThrottler {
    delay: Duration,
    deviation: Duration,
}

impl DelayThrottler {
    /// Creates a throttler adding `delay` to every chunk.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self {
            delay,
            deviation: Duration::ZERO,
        }
    }

    /// Builder-style setter for uniform jitter of `±deviation`.
    #[must_use]
    pub const fn with_deviation(mut self, deviation: Duration) -> Self {
        self.deviation = deviation;
        self
    }
}

impl Throttler for DelayThrottler {
    fn delay(&mut self, _now: Instant, _data: &[u8]) -> Duration {
        if self.deviation.is_zero() {
            return self.delay;
        }
        let spread = u64::try_from(self.deviation.as_nanos()).unwrap_or(u64::MAX / 2);
        let offset = rand::thread_rng().gen_range(0..=spread.saturating_mul(2));
        (self.delay + Duration::from_nanos(offset)).saturating_sub(self.deviation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay() {
        let mut throttler = DelayThrottler::new(Duration::from_millis(500));
        let now = Instant::now();
        assert_eq!(throttler.delay(now, b"abc"), Duration::from_millis(500));
        assert_eq!(throttler.delay(now, b""), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_in_range() {
        let mut throttler = DelayThrottler::new(Duration::from_millis(100))
            .with_deviation(Duration::from_millis(20));
        let now = Instant::now();
        for _ in 0..1000 {
            let d = throttler.delay(now, b"x");
            assert!(d >= Duration::from_millis(80) && d <= Duration::from_millis(120), "{d:?}");
        }
    }

    #[test]
    fn jitter_never_goes_negative() {
        let mut throttler =
            DelayThrottler::new(Duration::from_millis(1)).with_deviation(Duration::from_millis(50));
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(throttler.delay(now, b"x") <= Duration::from_millis(51));
        }
    }
}
