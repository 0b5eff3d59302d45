//! Software timers for the per-worker event loop.
//!
//! Deadlines live in a min-heap; the earliest one bounds the poll timeout
//! and due entries are popped after each poll round. Entries are never
//! cancelled: a session that disappears before its timer fires leaves a
//! stale entry behind, and the worker drops it when the key no longer
//! resolves.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Which of a session's four rearm timers an entry belongs to.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum WaitKind {
  ReadTls,
  WriteTls,
  ReadDst,
  WriteDst,
}

#[derive(Debug, Eq)]
struct Timeout {
  deadline: Instant,
  key: usize,
  kind: WaitKind,
}

impl Ord for Timeout {
  fn cmp(&self, other: &Timeout) -> Ordering {
    other.deadline.cmp(&self.deadline) // Reversed to make a min heap
  }
}

impl PartialOrd for Timeout {
  fn partial_cmp(&self, other: &Timeout) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl PartialEq for Timeout {
  fn eq(&self, other: &Timeout) -> bool {
    self.deadline == other.deadline
  }
}

#[derive(Debug)]
pub(crate) struct TimerQueue {
  heap: BinaryHeap<Timeout>,
}

impl TimerQueue {
  pub(crate) fn new() -> TimerQueue {
    TimerQueue { heap: BinaryHeap::new() }
  }

  pub(crate) fn arm(&mut self, key: usize, kind: WaitKind, delay: Duration) {
    self.heap.push(Timeout { deadline: Instant::now() + delay, key, kind });
  }

  /// Time until the earliest deadline, zero if it already passed, `None`
  /// if no timers are armed.
  pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
    self.heap.peek().map(|timeout| timeout.deadline.saturating_duration_since(now))
  }

  /// Pops the earliest entry whose deadline has passed.
  pub(crate) fn pop_due(&mut self, now: Instant) -> Option<(usize, WaitKind)> {
    if self.heap.peek().is_some_and(|timeout| timeout.deadline <= now) {
      return self.heap.pop().map(|timeout| (timeout.key, timeout.kind));
    }
    None
  }
}
