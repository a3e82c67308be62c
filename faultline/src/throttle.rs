//! Release-delay policies consulted when buffered data becomes ready.
//!
//! A throttler never drops data. It only answers "how long must this chunk
//! wait before it may be sent", and the relay arms a timer instead of
//! polling. Scope is decided by whoever owns the instance: a factory call per
//! connection direction gives per-peer limits, a single instance shared by a
//! whole relay gives a global limit.

mod delay;
mod rate;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;

pub use delay::DelayThrottler;
pub use rate::{ByteRateThrottler, PacketRateThrottler};

/// Computes how long a chunk must wait before release.
pub trait Throttler: Send {
    /// Returns the delay for `data`, which became ready at `now`.
    ///
    /// Called once per buffer slot (TCP) or datagram (UDP), after any
    /// transform filter has run.
    fn delay(&mut self, now: Instant, data: &[u8]) -> Duration;
}

/// Creates a throttler for the connection with the given remote address.
pub type ThrottlerFactory = Arc<dyn Fn(SocketAddr) -> Box<dyn Throttler> + Send + Sync>;

/// Throttler that never delays.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoThrottler;

impl Throttler for NoThrottler {
    fn delay(&mut self, _now: Instant, _data: &[u8]) -> Duration {
        Duration::ZERO
    }
}

impl<F> Throttler for F
where
    F: FnMut(Instant, &[u8]) -> Duration + Send,
{
    fn delay(&mut self, now: Instant, data: &[u8]) -> Duration {
        self(now, data)
    }
}

/// Builds a throttler for `addr` from an optional factory.
pub(crate) fn allocate(
    factory: Option<&ThrottlerFactory>,
    addr: SocketAddr,
) -> Option<Box<dyn Throttler>> {
    factory.map(|f| f(addr))
}
