// crates/bacnet-rs/src/task.rs
//! Millisecond-resolution timer bookkeeping for the cooperative scheduler.
//!
//! Every state machine installs at most one timer at a time; timers are
//! addressed by a `(target, token)` pair so the scheduler can route an
//! expiry back to its owner without holding a reference to it.

use alloc::collections::{BTreeMap, BinaryHeap};
use core::cmp::Reverse;

/// Who should be notified when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTarget {
    /// The application shell at the top of a stack.
    App,
    /// A protocol layer, identified by its slot in the stack.
    Layer(usize),
    /// The UDP director (peer idle timers).
    Director,
}

/// Handle returned by `install`; used only for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    deadline_ms: u64,
    target: TimerTarget,
    token: u64,
}

/// Ordered collection of pending timers.
///
/// Cancellation is lazy: the heap keeps the stale entry and skips it when
/// it surfaces, so both install and cancel stay logarithmic.
#[derive(Debug, Default)]
pub struct TaskManager {
    next_id: u64,
    entries: BTreeMap<u64, TimerEntry>,
    heap: BinaryHeap<Reverse<(u64, u64)>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a timer expiring at the absolute time `deadline_ms`.
    pub fn install(&mut self, deadline_ms: u64, target: TimerTarget, token: u64) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            TimerEntry {
                deadline_ms,
                target,
                token,
            },
        );
        self.heap.push(Reverse((deadline_ms, id)));
        TimerHandle(id)
    }

    /// Cancel a timer. Cancelling an already-fired timer is a no-op.
    pub fn cancel(&mut self, handle: TimerHandle) {
        self.entries.remove(&handle.0);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The deadline of the earliest live timer, if any.
    pub fn next_deadline(&mut self) -> Option<u64> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.entries.contains_key(&id) {
                return Some(deadline);
            }
            // stale (cancelled) entry
            self.heap.pop();
            let _ = deadline;
        }
        None
    }

    /// Remove and return the next timer due at or before `now_ms`.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<(TimerTarget, u64)> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now_ms {
                return None;
            }
            self.heap.pop();
            if let Some(entry) = self.entries.remove(&id) {
                return Some((entry.target, entry.token));
            }
            // stale entry, keep draining
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut tm = TaskManager::new();
        tm.install(300, TimerTarget::Layer(1), 30);
        tm.install(100, TimerTarget::Layer(1), 10);
        tm.install(200, TimerTarget::App, 20);

        assert_eq!(tm.next_deadline(), Some(100));
        assert_eq!(tm.pop_due(250), Some((TimerTarget::Layer(1), 10)));
        assert_eq!(tm.pop_due(250), Some((TimerTarget::App, 20)));
        assert_eq!(tm.pop_due(250), None);
        assert_eq!(tm.pop_due(300), Some((TimerTarget::Layer(1), 30)));
        assert!(tm.is_empty());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut tm = TaskManager::new();
        let h = tm.install(50, TimerTarget::Director, 1);
        tm.install(60, TimerTarget::Director, 2);
        tm.cancel(h);

        assert_eq!(tm.next_deadline(), Some(60));
        assert_eq!(tm.pop_due(100), Some((TimerTarget::Director, 2)));
        assert_eq!(tm.pop_due(100), None);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mut tm = TaskManager::new();
        let h = tm.install(10, TimerTarget::App, 7);
        assert_eq!(tm.pop_due(10), Some((TimerTarget::App, 7)));
        tm.cancel(h);
        assert!(tm.is_empty());
    }
}
