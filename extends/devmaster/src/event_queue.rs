//! ordering queue (spec module H): sorts events by `seqnum` before they
//! reach the execution queue, with a timeout so a missing sequence number
//! never stalls delivery forever.
use std::cell::{Cell, RefCell};

use crate::event::Event;

/// how long (seconds) a pending event may wait for its predecessor before
/// being released out of order.
const DEFAULT_EVENT_TIMEOUT: u64 = 30;
/// how long the initialization-phase clamp applies for, seconds since the
/// first insertion.
const INIT_PHASE_SECONDS: u64 = 10;
/// timeout used during the initialization phase, shorter so early holes
/// don't stall startup.
const INIT_PHASE_TIMEOUT: u64 = 3;

/// the ordering queue. `now()` and `release` are injected so tests don't
/// need a real clock or a real execution queue.
pub struct EventQueue {
    pending: RefCell<Vec<Event>>,
    expected_seqnum: Cell<u64>,
    event_timeout: u64,
    first_insert_at: Cell<Option<u64>>,
}

impl EventQueue {
    /// a fresh queue; `expected_seqnum` normally comes from
    /// `UDEVD_EXPECTED_SEQNUM`, `event_timeout` from `UDEVD_EVENT_TIMEOUT`.
    pub fn new(expected_seqnum: u64, event_timeout: u64) -> EventQueue {
        EventQueue {
            pending: RefCell::new(Vec::new()),
            expected_seqnum: Cell::new(expected_seqnum),
            event_timeout: if event_timeout == 0 { DEFAULT_EVENT_TIMEOUT } else { event_timeout },
            first_insert_at: Cell::new(None),
        }
    }

    /// insert an event, or bypass straight to `release` if `seqnum == 0`.
    /// Returns `true` if the event entered the ordering queue, `false` if it
    /// bypassed (caller already released it) or was dropped as a duplicate.
    pub fn insert(&self, mut event: Event, now: u64, release: &mut dyn FnMut(Event)) -> bool {
        if event.seqnum == 0 {
            release(event);
            return false;
        }

        if self.first_insert_at.get().is_none() {
            self.first_insert_at.set(Some(now));
        }
        event.queue_time = now;

        let mut pending = self.pending.borrow_mut();
        let mut i = pending.len();
        while i > 0 {
            let candidate_seqnum = pending[i - 1].seqnum;
            if candidate_seqnum == event.seqnum {
                // duplicate: silently dropped
                return false;
            }
            if candidate_seqnum < event.seqnum {
                break;
            }
            i -= 1;
        }
        pending.insert(i, event);
        true
    }

    fn timeout_for(&self, now: u64) -> u64 {
        match self.first_insert_at.get() {
            Some(first) if now.saturating_sub(first) < INIT_PHASE_SECONDS => INIT_PHASE_TIMEOUT,
            _ => self.event_timeout,
        }
    }

    /// release leading events whose `seqnum == expected_seqnum`, and any
    /// events that have aged past the timeout (advancing past the hole).
    /// Returns the number of microseconds until the next timeout deadline,
    /// if any events remain, for a one-shot re-check timer.
    pub fn run_pass(&self, now: u64, mut release: impl FnMut(Event)) -> Option<u64> {
        let timeout = self.timeout_for(now);

        loop {
            let mut pending = self.pending.borrow_mut();
            if pending.is_empty() {
                return None;
            }

            if pending[0].seqnum == self.expected_seqnum.get() {
                let event = pending.remove(0);
                drop(pending);
                self.expected_seqnum.set(self.expected_seqnum.get() + 1);
                release(event);
                continue;
            }

            let age = now.saturating_sub(pending[0].queue_time);
            if age >= timeout {
                let event = pending.remove(0);
                drop(pending);
                self.expected_seqnum.set(event.seqnum + 1);
                release(event);
                continue;
            }

            let remaining = (timeout - age) * 1_000_000;
            return Some(remaining);
        }
    }

    /// number of events currently waiting for their turn
    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// true if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seqnum: u64) -> Event {
        Event {
            seqnum,
            action: "add".to_string(),
            devpath: "/devices/x".to_string(),
            subsystem: "block".to_string(),
            physdevpath: None,
            major: None,
            minor: None,
            timeout_override: None,
            env: Vec::new(),
            source: crate::event::Source::Netlink,
            queue_time: 0,
            worker_pid: None,
        }
    }

    #[test]
    fn seqnum_zero_bypasses_queue() {
        let q = EventQueue::new(0, 30);
        let mut released = Vec::new();
        let inserted = q.insert(event(0), 0, &mut |e| released.push(e.seqnum));
        assert!(!inserted);
        assert_eq!(released, vec![0]);
        assert!(q.is_empty());
    }

    #[test]
    fn duplicate_seqnum_is_dropped() {
        let q = EventQueue::new(0, 30);
        let mut noop = |_: Event| {};
        assert!(q.insert(event(5), 0, &mut noop));
        assert!(!q.insert(event(5), 1, &mut noop));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn stays_sorted_ascending_on_out_of_order_insertion() {
        let q = EventQueue::new(0, 30);
        let mut noop = |_: Event| {};
        q.insert(event(3), 0, &mut noop);
        q.insert(event(1), 0, &mut noop);
        q.insert(event(2), 0, &mut noop);
        let seqnums: Vec<u64> = q.pending.borrow().iter().map(|e| e.seqnum).collect();
        assert_eq!(seqnums, vec![1, 2, 3]);
    }

    #[test]
    fn run_pass_releases_expected_in_order() {
        let q = EventQueue::new(0, 30);
        let mut noop = |_: Event| {};
        q.insert(event(0_u64 + 1), 0, &mut noop); // out of order, not expected yet
        q.insert(event(0), 0, &mut noop);

        let mut released = Vec::new();
        q.run_pass(0, |e| released.push(e.seqnum));
        assert_eq!(released, vec![0, 1]);
        assert!(q.is_empty());
    }

    #[test]
    fn hole_released_after_timeout_and_advances_expected() {
        let q = EventQueue::new(0, 10);
        let mut noop = |_: Event| {};
        // seqnum 1 arrives but 0 never does
        q.insert(event(1), 0, &mut noop);

        let mut released = Vec::new();
        let remaining = q.run_pass(5, |e| released.push(e.seqnum));
        assert!(released.is_empty());
        assert!(remaining.is_some());

        q.run_pass(10, |e| released.push(e.seqnum));
        assert_eq!(released, vec![1]);
    }

    #[test]
    fn initialization_phase_uses_shorter_timeout() {
        let q = EventQueue::new(0, 30);
        let mut noop = |_: Event| {};
        q.insert(event(1), 0, &mut noop);
        let mut released = Vec::new();
        // well within the 30s default timeout, but past the 3s init clamp
        q.run_pass(4, |e| released.push(e.seqnum));
        assert_eq!(released, vec![1]);
    }
}
