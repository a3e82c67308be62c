//! Bounded relay queues.
//!
//! [`BufferQueue`] backs one direction of a TCP pair: a fixed pool of slots
//! cycling between a writable (filling) and a readable (ready to send) list.
//! [`DatagramQueue`] is its message-preserving counterpart for UDP.
//!
//! Both queues run the transform filter and consult the throttler exactly
//! once per chunk, at the moment the chunk becomes ready, and both take the
//! current instant from the caller.

mod datagram;

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::time::Duration;

use minstant::Instant;

pub use datagram::{DatagramQueue, DEFAULT_PENDING_LIMIT};

use crate::error::{Error, Result};
use crate::filter::{self, TransformFilter};
use crate::throttle::Throttler;

/// Default number of slots per queue.
pub const DEFAULT_BUFFER_COUNT: usize = 64;

/// Default slot size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Slot pool dimensions for one relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Number of slots in the pool.
    pub count: usize,
    /// Capacity of each slot in bytes.
    pub size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            count: DEFAULT_BUFFER_COUNT,
            size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl BufferConfig {
    /// Builder-style setter for the slot count.
    #[must_use]
    pub const fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Builder-style setter for the slot size.
    #[must_use]
    pub const fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Total bytes a queue built from this config can hold.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.count * self.size
    }

    /// Checks that a queue can be built from this config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the slot count or size is zero.
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(Error::InvalidConfig("buffer count must be > 0"));
        }
        if self.size == 0 {
            return Err(Error::InvalidConfig("buffer size must be > 0"));
        }
        Ok(())
    }
}

/// Outcome of one [`BufferQueue::drain_with`] or [`DatagramQueue::send_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// The sink accepted this many bytes.
    Written(usize),
    /// Data is queued but the earliest chunk is held back for this long.
    Delayed(Duration),
    /// Nothing is queued.
    Idle,
}

#[derive(Debug)]
struct Slot {
    data: Box<[u8]>,
    /// Next byte to send.
    start: usize,
    /// One past the last filled byte.
    end: usize,
    release_at: Instant,
}

impl Slot {
    fn new(size: usize, now: Instant) -> Self {
        Self {
            data: vec![0u8; size].into_boxed_slice(),
            start: 0,
            end: 0,
            release_at: now,
        }
    }

    fn filled(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    fn len(&self) -> usize {
        self.end - self.start
    }

    fn spare(&self) -> usize {
        self.data.len() - self.end
    }

    fn is_full(&self) -> bool {
        self.end == self.data.len()
    }

    fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

/// Fixed slot pool relaying one TCP direction.
///
/// Data enters through [`fill_with`](Self::fill_with), which scatters one
/// read over the writable slots, and leaves through
/// [`drain_with`](Self::drain_with), which gathers the ready prefix of the
/// readable slots into one write. No memory is allocated after construction
/// apart from the per-call slice vectors.
pub struct BufferQueue {
    writable: VecDeque<Slot>,
    readable: VecDeque<Slot>,
    filter: Option<Box<dyn TransformFilter>>,
    throttler: Option<Box<dyn Throttler>>,
}

impl std::fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferQueue")
            .field("writable", &self.writable.len())
            .field("readable", &self.readable.len())
            .field("pending_bytes", &self.readable_bytes())
            .finish_non_exhaustive()
    }
}

impl BufferQueue {
    /// Creates a queue with `config.count` empty slots.
    ///
    /// # Panics
    ///
    /// Panics if `config.count` or `config.size` is zero; see
    /// [`BufferConfig::validate`].
    #[must_use]
    pub fn new(
        config: &BufferConfig,
        filter: Option<Box<dyn TransformFilter>>,
        throttler: Option<Box<dyn Throttler>>,
    ) -> Self {
        assert!(config.count > 0, "buffer count must be > 0");
        assert!(config.size > 0, "buffer size must be > 0");

        let now = Instant::now();
        Self {
            writable: (0..config.count).map(|_| Slot::new(config.size, now)).collect(),
            readable: VecDeque::with_capacity(config.count),
            filter,
            throttler,
        }
    }

    /// Returns `true` if any data is queued, ready or not, including a
    /// partially filled writable slot.
    #[must_use]
    pub fn has_readable(&self) -> bool {
        if let Some(head) = self.readable.front() {
            assert!(head.len() > 0, "drained slot left in the readable list");
            return true;
        }
        self.writable.front().is_some_and(|head| head.end > 0)
    }

    /// Returns `true` if at least one slot can accept more bytes.
    #[must_use]
    pub fn has_writable(&self) -> bool {
        match self.writable.front() {
            Some(head) => {
                assert!(!head.is_full(), "full slot left in the writable list");
                true
            }
            None => false,
        }
    }

    /// Bytes queued for sending.
    #[must_use]
    pub fn readable_bytes(&self) -> usize {
        let ready: usize = self.readable.iter().map(Slot::len).sum();
        ready + self.writable.front().map_or(0, |head| head.end)
    }

    /// Bytes that can still be accepted before the pool saturates.
    #[must_use]
    pub fn writable_bytes(&self) -> usize {
        self.writable.iter().map(Slot::spare).sum()
    }

    /// Scatters one read into the writable slots.
    ///
    /// `read` receives the free space of every writable slot, in order, and
    /// returns how many bytes it stored. Slots that became full are run
    /// through the filter and throttler and moved to the readable list. A
    /// zero return is passed through untouched so the caller can detect end
    /// of stream.
    ///
    /// Callers must check [`has_writable`](Self::has_writable) first.
    ///
    /// # Errors
    ///
    /// Returns whatever `read` returns. Nothing is consumed on error.
    pub fn fill_with<F>(&mut self, now: Instant, read: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [IoSliceMut<'_>]) -> io::Result<usize>,
    {
        debug_assert!(self.has_writable(), "fill on a saturated queue");

        let n = {
            let mut bufs: Vec<IoSliceMut<'_>> = self
                .writable
                .iter_mut()
                .map(|slot| IoSliceMut::new(&mut slot.data[slot.end..]))
                .collect();
            read(&mut bufs)?
        };

        let mut left = n;
        for slot in &mut self.writable {
            if left == 0 {
                break;
            }
            let take = left.min(slot.spare());
            slot.end += take;
            left -= take;
        }
        debug_assert_eq!(left, 0, "reader reported more bytes than offered");

        while self.writable.front().is_some_and(Slot::is_full) {
            self.demote_head(now);
        }

        Ok(n)
    }

    /// Gathers the ready prefix of queued data into one write.
    ///
    /// A partially filled writable slot is first treated as complete, so
    /// data never waits for a slot to fill up. If the earliest queued chunk
    /// is not yet due, `write` is not called and the remaining delay is
    /// returned instead.
    ///
    /// # Errors
    ///
    /// Returns whatever `write` returns. Nothing is consumed on error.
    pub fn drain_with<F>(&mut self, now: Instant, write: F) -> io::Result<Drain>
    where
        F: FnOnce(&[IoSlice<'_>]) -> io::Result<usize>,
    {
        if self.writable.front().is_some_and(|head| head.end > 0) {
            self.demote_head(now);
        }

        let Some(head) = self.readable.front() else {
            return Ok(Drain::Idle);
        };
        if head.release_at > now {
            return Ok(Drain::Delayed(head.release_at.duration_since(now)));
        }

        let n = {
            let bufs: Vec<IoSlice<'_>> = self
                .readable
                .iter()
                .take_while(|slot| slot.release_at <= now)
                .map(|slot| IoSlice::new(slot.filled()))
                .collect();
            write(&bufs)?
        };

        let mut left = n;
        while let Some(head) = self.readable.front_mut() {
            let take = left.min(head.len());
            head.start += take;
            left -= take;
            if head.len() > 0 {
                break;
            }
            if let Some(mut slot) = self.readable.pop_front() {
                slot.clear();
                self.writable.push_back(slot);
            }
        }
        debug_assert_eq!(left, 0, "writer reported more bytes than offered");

        Ok(Drain::Written(n))
    }

    /// Drops all queued data and returns every slot to the writable list.
    pub fn reset(&mut self) {
        self.writable.extend(self.readable.drain(..));
        for slot in &mut self.writable {
            slot.clear();
        }
    }

    fn demote_head(&mut self, now: Instant) {
        let Some(mut slot) = self.writable.pop_front() else {
            return;
        };

        let kept = filter::apply(self.filter.as_mut(), &mut slot.data[..slot.end]);
        slot.end = kept;

        if kept == 0 {
            slot.clear();
            self.writable.push_back(slot);
            return;
        }

        let delay = self
            .throttler
            .as_mut()
            .map_or(Duration::ZERO, |t| t.delay(now, slot.filled()));
        slot.release_at = now + delay;
        self.readable.push_back(slot);
    }
}
