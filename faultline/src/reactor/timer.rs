//! Deadline-ordered one-shot timers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use minstant::Instant;

struct ScheduledTask<A> {
    deadline: Instant,
    /// Insertion order; breaks ties so equal deadlines fire FIFO.
    seq: u64,
    action: A,
}

impl<A> PartialEq for ScheduledTask<A> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<A> Eq for ScheduledTask<A> {}

impl<A> PartialOrd for ScheduledTask<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A> Ord for ScheduledTask<A> {
    // Reversed: BinaryHeap is a max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of actions keyed by deadline. Owned by the reactor thread.
pub struct TimerQueue<A> {
    heap: BinaryHeap<ScheduledTask<A>>,
    seq: u64,
}

impl<A> Default for TimerQueue<A> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }
}

impl<A> TimerQueue<A> {
    /// Schedules `action` to fire at `deadline`.
    pub fn push(&mut self, deadline: Instant, action: A) {
        self.seq += 1;
        self.heap.push(ScheduledTask {
            deadline,
            seq: self.seq,
            action,
        });
    }

    /// Earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|t| t.deadline)
    }

    /// Pops the earliest action if its deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<A> {
        if self.heap.peek()?.deadline > now {
            return None;
        }
        self.heap.pop().map(|t| t.action)
    }

    /// Number of pending timers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns `true` if no timer is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drops every pending action without running it.
    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let t0 = Instant::now();
        let mut timers = TimerQueue::default();
        timers.push(t0 + Duration::from_millis(30), "c");
        timers.push(t0 + Duration::from_millis(10), "a");
        timers.push(t0 + Duration::from_millis(20), "b");

        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_millis(10)));

        let now = t0 + Duration::from_millis(25);
        let fired: Vec<_> = std::iter::from_fn(|| timers.pop_due(now)).collect();
        assert_eq!(fired, vec!["a", "b"]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn equal_deadlines_fire_fifo() {
        let t0 = Instant::now();
        let mut timers = TimerQueue::default();
        for i in 0..5 {
            timers.push(t0, i);
        }
        let fired: Vec<_> = std::iter::from_fn(|| timers.pop_due(t0)).collect();
        assert_eq!(fired, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn nothing_due_before_deadline() {
        let t0 = Instant::now();
        let mut timers = TimerQueue::default();
        timers.push(t0 + Duration::from_secs(1), ());
        assert!(timers.pop_due(t0).is_none());
        timers.clear();
        assert!(timers.is_empty());
    }
}
