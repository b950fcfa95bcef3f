//! Global monotonic timer queue driving ring/CFNA/reset/invite-expiry
//! deadlines, plus the per-call INITIAL safety net.
//!
//! Grounded on the `TimerQueue`/`Timer` abstraction in
//! `original_source/server/server.h`: entries are millisecond deadlines
//! popped by the background thread, never by a worker.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Ring,
    Cfna,
    Reset,
    InviteExpires,
    InitialSafety,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    pub due_ms: i64,
    pub call_id: i64,
    pub kind: TimerKind,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so `BinaryHeap` (max-heap) behaves as a min-heap on
        // `due_ms` — earliest deadline pops first.
        other.due_ms.cmp(&self.due_ms)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimerQueue {
    heap: Mutex<BinaryHeap<TimerEntry>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn arm(&self, call_id: i64, kind: TimerKind, delay_ms: u64) {
        let entry = TimerEntry {
            due_ms: now_ms() + delay_ms as i64,
            call_id,
            kind,
        };
        self.heap.lock().expect("timer queue poisoned").push(entry);
    }

    /// Pop and return every entry whose deadline has passed.
    pub fn drain_due(&self) -> Vec<TimerEntry> {
        let mut heap = self.heap.lock().expect("timer queue poisoned");
        let t = now_ms();
        let mut due = Vec::new();
        while let Some(top) = heap.peek() {
            if top.due_ms > t {
                break;
            }
            due.push(heap.pop().unwrap());
        }
        due
    }

    /// Milliseconds until the next deadline, or `None` if the queue is
    /// empty — used by the background thread to bound its sleep.
    pub fn next_deadline_ms(&self) -> Option<i64> {
        self.heap
            .lock()
            .expect("timer queue poisoned")
            .peek()
            .map(|e| (e.due_ms - now_ms()).max(0))
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("timer queue poisoned").len()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_entries_pop_in_deadline_order() {
        let q = TimerQueue::new();
        q.arm(1, TimerKind::Ring, 0);
        q.arm(2, TimerKind::Cfna, 0);
        q.arm(3, TimerKind::Reset, 10_000);
        let due = q.drain_due();
        assert_eq!(due.len(), 2);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn next_deadline_reflects_soonest_entry() {
        let q = TimerQueue::new();
        q.arm(1, TimerKind::Ring, 5_000);
        let ms = q.next_deadline_ms().unwrap();
        assert!(ms <= 5_000 && ms > 0);
    }
}
