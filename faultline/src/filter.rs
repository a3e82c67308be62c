//! Caller-supplied hooks applied to relayed data.
//!
//! Filters are created per connection direction from factories keyed by the
//! remote peer address, and run on the reactor thread.

mod logging;

use std::net::SocketAddr;
use std::sync::Arc;

pub use logging::LoggingFilter;

/// Rewrites buffered bytes in place before they are queued for sending.
pub trait TransformFilter: Send {
    /// Rewrites `data` in place and returns the number of leading bytes to
    /// keep. Returning `0` discards the chunk. Values larger than
    /// `data.len()` are clamped.
    fn transform(&mut self, data: &mut [u8]) -> usize;
}

impl<F> TransformFilter for F
where
    F: FnMut(&mut [u8]) -> usize + Send,
{
    fn transform(&mut self, data: &mut [u8]) -> usize {
        self(data)
    }
}

/// Decides whether a datagram is relayed or silently dropped.
pub trait PassFilter: Send {
    /// Returns `true` to relay `data`.
    fn check(&mut self, data: &[u8]) -> bool;
}

impl<F> PassFilter for F
where
    F: FnMut(&[u8]) -> bool + Send,
{
    fn check(&mut self, data: &[u8]) -> bool {
        self(data)
    }
}

/// Creates a transform filter for the connection with the given peer.
pub type TransformFilterFactory = Arc<dyn Fn(SocketAddr) -> Box<dyn TransformFilter> + Send + Sync>;

/// Creates a pass filter for the connection with the given peer.
pub type PassFilterFactory = Arc<dyn Fn(SocketAddr) -> Box<dyn PassFilter> + Send + Sync>;

/// Accepts or rejects a new client before any relay state is created.
pub type AdmissionFilter = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// Flips every bit. Applying it on both directions of a round trip restores
/// the original bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct InvertFilter;

impl InvertFilter {
    /// Factory producing an `InvertFilter` for every peer.
    #[must_use]
    pub fn factory() -> TransformFilterFactory {
        Arc::new(|_: SocketAddr| Box::new(Self) as Box<dyn TransformFilter>)
    }
}

impl TransformFilter for InvertFilter {
    fn transform(&mut self, data: &mut [u8]) -> usize {
        for b in data.iter_mut() {
            *b = !*b;
        }
        data.len()
    }
}

/// Builds a transform filter for `addr` from an optional factory.
pub(crate) fn allocate(
    factory: Option<&TransformFilterFactory>,
    addr: SocketAddr,
) -> Option<Box<dyn TransformFilter>> {
    factory.map(|f| f(addr))
}

/// Builds a pass filter for `addr` from an optional factory.
pub(crate) fn allocate_pass(
    factory: Option<&PassFilterFactory>,
    addr: SocketAddr,
) -> Option<Box<dyn PassFilter>> {
    factory.map(|f| f(addr))
}

/// Runs `filter` over `data` and returns the clamped kept length.
pub(crate) fn apply(filter: Option<&mut Box<dyn TransformFilter>>, data: &mut [u8]) -> usize {
    match filter {
        Some(filter) => filter.transform(data).min(data.len()),
        None => data.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invert_is_an_involution() {
        let mut data = *b"\x00\x01\xfe\xffabc";
        let mut filter = InvertFilter;

        assert_eq!(filter.transform(&mut data), 7);
        assert_eq!(&data[..4], &[0xff, 0xfe, 0x01, 0x00]);

        filter.transform(&mut data);
        assert_eq!(&data, b"\x00\x01\xfe\xffabc");
    }

    #[test]
    fn apply_clamps_overlong_result() {
        let mut grow: Box<dyn TransformFilter> = Box::new(|data: &mut [u8]| data.len() + 10);
        let mut data = [1u8; 4];
        assert_eq!(apply(Some(&mut grow), &mut data), 4);
        assert_eq!(apply(None, &mut data), 4);
    }

    #[test]
    fn closures_are_filters() {
        let mut drop_odd = |data: &[u8]| data.len() % 2 == 0;
        assert!(drop_odd.check(b"ab"));
        assert!(!drop_odd.check(b"a"));

        let factory: TransformFilterFactory = InvertFilter::factory();
        let mut filter = factory("127.0.0.1:1".parse().unwrap());
        let mut data = [0u8; 2];
        filter.transform(&mut data);
        assert_eq!(data, [0xff, 0xff]);
    }
}
