//! A minimal software timer wheel for the single-threaded reactor.
//!
//! `mio` has no built-in timer facility, so the reactor keeps a min-heap of
//! `(deadline, TimerId)` pairs and asks `Poll::poll` to wait no longer than
//! the next deadline.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

pub type TimerId = u64;

#[derive(Debug, Clone, Copy)]
pub enum TimerKind {
    /// Reconnect backoff after a broken device was torn down.
    UsbReconnect { switch: usize },
    /// Debounced persistence write for one switch.
    Persist { switch: usize },
    /// TCP idle timeout for one client.
    ClientIdle { client: u64 },
}

struct Entry {
    deadline: Instant,
    id: TimerId,
    kind: TimerKind,
    /// Cancelled timers are left in the heap and skipped when popped,
    /// rather than removed in place (the heap has no efficient arbitrary
    /// removal); a cancelled timer is simply never re-armed.
    cancelled: bool,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Entry>,
    next_id: TimerId,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel { heap: BinaryHeap::new(), next_id: 1 }
    }

    pub fn add(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Entry { deadline: Instant::now() + delay, id, kind, cancelled: false });
        id
    }

    /// Cancels a previously scheduled timer. No-op if it already fired.
    pub fn cancel(&mut self, id: TimerId) {
        // We cannot mutate heap entries in place without rebuilding; since
        // cancellations are rare (persist debounce re-arm checks first) we
        // rebuild the heap, which is O(n) but n is tiny (a handful of
        // switches/clients' worth of live timers).
        let items: Vec<Entry> = self.heap.drain().collect();
        for mut e in items {
            if e.id == id {
                e.cancelled = true;
            }
            self.heap.push(e);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pops every timer whose deadline has passed, in deadline order.
    pub fn pop_expired(&mut self) -> Vec<TimerKind> {
        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let e = self.heap.pop().unwrap();
            if !e.cancelled {
                fired.push(e.kind);
            }
        }
        fired
    }
}
