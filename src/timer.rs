//! Priority queue of pending timer events, keyed on an absolute millisecond
//! deadline. The server uses one heap for the stop watchdog, the heartbeat
//! sender/expirer, and the handshake-timeout sweep; the reactor asks it for
//! the next deadline to bound how long it blocks in the readiness wait.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// What kind of periodic work a fired timer represents. The server matches
/// on this to decide which sweep to run; the reactor itself never inspects
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    StopWatchdog,
    HeartbeatSend,
    HeartbeatExpire,
    HandshakeTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerEntry {
    deadline_ms: u64,
    kind: TimerKind,
}

// `BinaryHeap` is a max-heap; flip the comparison so the earliest deadline
// sorts to the top.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline_ms.cmp(&self.deadline_ms)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of `(deadline_ms, TimerKind)` pairs.
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, deadline_ms: u64, kind: TimerKind) {
        self.heap.push(TimerEntry { deadline_ms, kind });
    }

    /// Deadline of the soonest-firing timer, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.deadline_ms)
    }

    /// Pop every timer whose deadline is `<= now_ms`, in deadline order.
    pub fn drain_expired(&mut self, now_ms: u64) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline_ms > now_ms {
                break;
            }
            fired.push(self.heap.pop().unwrap().kind);
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut heap = TimerHeap::new();
        heap.push(300, TimerKind::HeartbeatExpire);
        heap.push(100, TimerKind::StopWatchdog);
        heap.push(200, TimerKind::HeartbeatSend);

        assert_eq!(heap.next_deadline(), Some(100));
        assert_eq!(heap.drain_expired(50), vec![]);
        assert_eq!(heap.drain_expired(250), vec![TimerKind::StopWatchdog, TimerKind::HeartbeatSend]);
        assert_eq!(heap.next_deadline(), Some(300));
    }

    #[test]
    fn drains_ties_together() {
        let mut heap = TimerHeap::new();
        heap.push(100, TimerKind::StopWatchdog);
        heap.push(100, TimerKind::HandshakeTimeout);
        assert_eq!(heap.drain_expired(100).len(), 2);
        assert!(heap.is_empty());
    }
}
