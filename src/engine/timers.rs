//! Timer governor — tracks and bounds the virtual timers one invocation
//! registers via `setTimeout`.
//!
//! Handles are owned exclusively by this per-invocation registry; the
//! callbacks themselves live in a JS-side map keyed by handle. The central
//! invariant: every handle still tracked when the invocation ends is
//! reclaimed by `cancel_all()` before the envelope is returned, on every
//! exit path.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Registration failed because the concurrent-timer cap was reached.
/// The timer is not created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerLimitExceeded {
    pub max_timers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: u32,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimerGovernor {
    next_id: u32,
    next_seq: u64,
    active: HashSet<u32>,
    queue: BinaryHeap<Reverse<TimerEntry>>,
    max_timers: usize,
}

impl TimerGovernor {
    pub fn new(max_timers: usize) -> Self {
        Self {
            next_id: 1,
            next_seq: 0,
            active: HashSet::new(),
            queue: BinaryHeap::new(),
            max_timers,
        }
    }

    /// Registers a timer due after `delay`, returning its handle.
    /// Fails without creating anything once the active cap is reached.
    pub fn register(&mut self, delay: Duration, now: Instant) -> Result<u32, TimerLimitExceeded> {
        if self.active.len() >= self.max_timers {
            return Err(TimerLimitExceeded {
                max_timers: self.max_timers,
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.active.insert(id);
        self.queue.push(Reverse(TimerEntry {
            deadline: now + delay,
            seq,
            id,
        }));
        Ok(id)
    }

    /// Cancels one handle. Returns whether it was still active.
    pub fn cancel(&mut self, id: u32) -> bool {
        self.active.remove(&id)
    }

    /// Pops every timer due at `now`, in deadline order (registration order
    /// for equal deadlines). Cancelled handles are skipped and discarded.
    pub fn pop_due(&mut self, now: Instant) -> Vec<u32> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.queue.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.queue.pop().expect("peeked entry").0;
            if self.active.remove(&entry.id) {
                due.push(entry.id);
            }
        }
        due
    }

    /// Earliest deadline among still-active timers, if any.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.queue.peek() {
            if self.active.contains(&entry.id) {
                return Some(entry.deadline);
            }
            self.queue.pop();
        }
        None
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Teardown: mechanically cancels every remaining handle. Returns how
    /// many were reclaimed.
    pub fn cancel_all(&mut self) -> usize {
        let reclaimed = self.active.len();
        self.active.clear();
        self.queue.clear();
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_fire_in_deadline_order() {
        let now = Instant::now();
        let mut g = TimerGovernor::new(100);
        let slow = g.register(Duration::from_millis(50), now).unwrap();
        let fast = g.register(Duration::from_millis(10), now).unwrap();

        let due = g.pop_due(now + Duration::from_millis(60));
        assert_eq!(due, vec![fast, slow]);
        assert_eq!(g.active_count(), 0);
    }

    #[test]
    fn test_equal_deadlines_fire_in_registration_order() {
        let now = Instant::now();
        let mut g = TimerGovernor::new(100);
        let a = g.register(Duration::from_millis(10), now).unwrap();
        let b = g.register(Duration::from_millis(10), now).unwrap();
        assert_eq!(g.pop_due(now + Duration::from_millis(10)), vec![a, b]);
    }

    #[test]
    fn test_cap_rejects_without_creating() {
        let now = Instant::now();
        let mut g = TimerGovernor::new(2);
        g.register(Duration::from_millis(1), now).unwrap();
        g.register(Duration::from_millis(1), now).unwrap();
        let err = g.register(Duration::from_millis(1), now).unwrap_err();
        assert_eq!(err.max_timers, 2);
        assert_eq!(g.active_count(), 2);
    }

    #[test]
    fn test_cancel_frees_a_slot() {
        let now = Instant::now();
        let mut g = TimerGovernor::new(1);
        let id = g.register(Duration::from_millis(1), now).unwrap();
        assert!(g.cancel(id));
        assert!(!g.cancel(id));
        g.register(Duration::from_millis(1), now).unwrap();
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let now = Instant::now();
        let mut g = TimerGovernor::new(10);
        let id = g.register(Duration::from_millis(5), now).unwrap();
        let kept = g.register(Duration::from_millis(5), now).unwrap();
        g.cancel(id);
        assert_eq!(g.pop_due(now + Duration::from_millis(10)), vec![kept]);
    }

    #[test]
    fn test_next_deadline_skips_cancelled() {
        let now = Instant::now();
        let mut g = TimerGovernor::new(10);
        let early = g.register(Duration::from_millis(5), now).unwrap();
        g.register(Duration::from_millis(20), now).unwrap();
        g.cancel(early);
        let next = g.next_deadline().unwrap();
        assert_eq!(next, now + Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_all_reclaims_everything() {
        let now = Instant::now();
        let mut g = TimerGovernor::new(10);
        g.register(Duration::from_millis(5), now).unwrap();
        g.register(Duration::from_millis(5), now).unwrap();
        assert_eq!(g.cancel_all(), 2);
        assert_eq!(g.active_count(), 0);
        assert!(g.next_deadline().is_none());
        assert_eq!(g.cancel_all(), 0);
    }

    #[test]
    fn test_handles_are_unique_within_invocation() {
        let now = Instant::now();
        let mut g = TimerGovernor::new(10);
        let a = g.register(Duration::from_millis(1), now).unwrap();
        g.cancel(a);
        let b = g.register(Duration::from_millis(1), now).unwrap();
        assert_ne!(a, b);
    }
}
