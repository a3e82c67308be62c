use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use minstant::Instant;

use super::Drain;
use crate::throttle::Throttler;
use crate::trace::{debug, warn};

/// Default cap on datagrams waiting in one queue.
pub const DEFAULT_PENDING_LIMIT: usize = 64 * 1024;

#[derive(Debug)]
struct Datagram {
    peer: SocketAddr,
    data: Vec<u8>,
    release_at: Instant,
}

/// FIFO of whole datagrams with a pending limit.
///
/// Datagram boundaries are preserved, so a zero-length datagram is an
/// ordinary entry. When the limit is reached the newest datagram is dropped.
pub struct DatagramQueue {
    entries: VecDeque<Datagram>,
    limit: usize,
    throttler: Option<Box<dyn Throttler>>,
}

impl std::fmt::Debug for DatagramQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramQueue")
            .field("pending", &self.entries.len())
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl DatagramQueue {
    /// Creates an empty queue holding at most `limit` datagrams.
    #[must_use]
    pub fn new(limit: usize, throttler: Option<Box<dyn Throttler>>) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
            throttler,
        }
    }

    /// Number of queued datagrams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queues `data` for `peer`. Returns `false` if the datagram was dropped
    /// because the queue is full.
    pub fn push(&mut self, now: Instant, peer: SocketAddr, data: Vec<u8>) -> bool {
        if self.entries.len() >= self.limit {
            debug!(%peer, len = data.len(), limit = self.limit, "pending limit exceeded, datagram dropped");
            return false;
        }

        let delay = self
            .throttler
            .as_mut()
            .map_or(Duration::ZERO, |t| t.delay(now, &data));
        self.entries.push_back(Datagram {
            peer,
            data,
            release_at: now + delay,
        });
        true
    }

    /// Sends the head datagram if it is due.
    ///
    /// The head is removed once `send` returns, whatever length it reports.
    /// A short send cannot happen for datagrams and is only logged.
    ///
    /// # Errors
    ///
    /// Returns whatever `send` returns. The head stays queued on error.
    pub fn send_with<F>(&mut self, now: Instant, send: F) -> io::Result<Drain>
    where
        F: FnOnce(SocketAddr, &[u8]) -> io::Result<usize>,
    {
        let Some(head) = self.entries.front() else {
            return Ok(Drain::Idle);
        };
        if head.release_at > now {
            return Ok(Drain::Delayed(head.release_at.duration_since(now)));
        }

        let n = send(head.peer, &head.data)?;
        if n != head.data.len() {
            warn!(peer = %head.peer, sent = n, len = head.data.len(), "datagram was split");
        }
        self.entries.pop_front();
        Ok(Drain::Written(n))
    }

    /// Drops the head datagram without sending it. Returns `false` if the
    /// queue was empty.
    pub fn discard(&mut self) -> bool {
        self.entries.pop_front().is_some()
    }

    /// Drops everything queued.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::DelayThrottler;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn preserves_boundaries_and_order() {
        let now = Instant::now();
        let mut queue = DatagramQueue::new(16, None);
        assert!(queue.push(now, addr(1), b"first".to_vec()));
        assert!(queue.push(now, addr(2), Vec::new()));
        assert!(queue.push(now, addr(1), b"third".to_vec()));

        let mut sent = Vec::new();
        while let Drain::Written(_) = queue
            .send_with(now, |peer, data| {
                sent.push((peer, data.to_vec()));
                Ok(data.len())
            })
            .unwrap()
        {}

        assert_eq!(
            sent,
            vec![
                (addr(1), b"first".to_vec()),
                (addr(2), Vec::new()),
                (addr(1), b"third".to_vec()),
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn newest_is_dropped_at_limit() {
        let now = Instant::now();
        let mut queue = DatagramQueue::new(2, None);
        assert!(queue.push(now, addr(1), vec![1]));
        assert!(queue.push(now, addr(1), vec![2]));
        assert!(!queue.push(now, addr(1), vec![3]));
        assert_eq!(queue.len(), 2);

        let mut first = Vec::new();
        queue
            .send_with(now, |_, data| {
                first.extend_from_slice(data);
                Ok(data.len())
            })
            .unwrap();
        assert_eq!(first, vec![1]);
    }

    #[test]
    fn delayed_head_blocks_queue() {
        let now = Instant::now();
        let throttler = DelayThrottler::new(Duration::from_millis(20));
        let mut queue = DatagramQueue::new(8, Some(Box::new(throttler)));
        queue.push(now, addr(1), vec![0; 10]);

        let result = queue.send_with(now, |_, _| panic!("sent too early")).unwrap();
        assert_eq!(result, Drain::Delayed(Duration::from_millis(20)));

        let later = now + Duration::from_millis(20);
        let result = queue.send_with(later, |_, data| Ok(data.len())).unwrap();
        assert_eq!(result, Drain::Written(10));
    }

    #[test]
    fn failed_send_keeps_head() {
        let now = Instant::now();
        let mut queue = DatagramQueue::new(8, None);
        queue.push(now, addr(1), vec![1, 2, 3]);

        let err = queue
            .send_with(now, |_, _| Err(io::ErrorKind::WouldBlock.into()))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.send_with(now, |_, d| Ok(d.len())).unwrap(), Drain::Written(3));
        assert_eq!(queue.send_with(now, |_, d| Ok(d.len())).unwrap(), Drain::Idle);
    }

    #[test]
    fn discard_skips_head() {
        let now = Instant::now();
        let mut queue = DatagramQueue::new(8, None);
        queue.push(now, addr(1), vec![1]);
        queue.push(now, addr(2), vec![2]);

        assert!(queue.discard());
        let mut peer = None;
        queue
            .send_with(now, |to, data| {
                peer = Some(to);
                Ok(data.len())
            })
            .unwrap();
        assert_eq!(peer, Some(addr(2)));
        assert!(!queue.discard());
    }
}
