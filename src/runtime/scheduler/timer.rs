//! Clock and timers
//!
//! Scheduler time is a `Duration` since the scheduler was created. With the
//! virtual clock, time stands still while any task can run and jumps to the
//! next timer deadline once nothing else can make progress.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::task::Waker;
use std::time::{Duration, Instant};

use super::Core;
use crate::util::config::ClockMode;

/// Time source of one scheduler.
#[derive(Debug)]
pub(crate) enum Clock {
    Real { start: Instant },
    Virtual { now: Cell<Duration> },
}

impl Clock {
    pub fn new(mode: ClockMode) -> Self {
        match mode {
            ClockMode::Real => Clock::Real {
                start: Instant::now(),
            },
            ClockMode::Virtual => Clock::Virtual {
                now: Cell::new(Duration::ZERO),
            },
        }
    }

    #[inline]
    pub fn now(&self) -> Duration {
        match self {
            Clock::Real { start } => start.elapsed(),
            Clock::Virtual { now } => now.get(),
        }
    }

    #[inline]
    pub fn is_virtual(&self) -> bool {
        matches!(self, Clock::Virtual { .. })
    }

    /// Move virtual time forward to `at`. No-op for the real clock and for
    /// instants in the past.
    pub fn advance_to(
        &self,
        at: Duration,
    ) {
        if let Clock::Virtual { now } = self {
            if at > now.get() {
                now.set(at);
            }
        }
    }
}

struct TimerEntry {
    at: Duration,
    seq: u64,
    waker: Waker,
    cancelled: Rc<Cell<bool>>,
}

impl PartialEq for TimerEntry {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(
        &self,
        other: &Self,
    ) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed: `BinaryHeap` is a max-heap and the earliest deadline must
    // come out first. Equal deadlines fire in registration order.
    fn cmp(
        &self,
        other: &Self,
    ) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending timers ordered by deadline.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn schedule(
        &mut self,
        at: Duration,
        waker: Waker,
    ) -> TimerHandle {
        let cancelled = Rc::new(Cell::new(false));
        self.heap.push(TimerEntry {
            at,
            seq: self.next_seq,
            waker,
            cancelled: cancelled.clone(),
        });
        self.next_seq += 1;
        TimerHandle { cancelled }
    }

    /// Earliest live deadline. Cancelled entries on top are dropped.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        while let Some(top) = self.heap.peek() {
            if top.cancelled.get() {
                self.heap.pop();
            } else {
                return Some(top.at);
            }
        }
        None
    }

    /// Wake every timer due at `now`. Returns how many fired.
    pub fn fire(
        &mut self,
        now: Duration,
    ) -> usize {
        let mut fired = 0;
        while let Some(top) = self.heap.peek() {
            if top.at > now {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                if !entry.cancelled.get() {
                    entry.waker.wake();
                    fired += 1;
                }
            }
        }
        fired
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

/// Keeps a timer armed; dropping it cancels the timer.
pub(crate) struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancelled.set(true);
    }
}

/// A point in scheduler time that a suspended task waits for.
pub(crate) struct Deadline {
    core: Rc<Core>,
    at: Duration,
    timer: Option<TimerHandle>,
}

impl Deadline {
    pub fn after(
        core: &Rc<Core>,
        timeout: Duration,
    ) -> Self {
        Self {
            core: core.clone(),
            at: core.clock.now().saturating_add(timeout),
            timer: None,
        }
    }

    /// True once the deadline has passed. Otherwise arms a timer that wakes
    /// `waker` at the deadline.
    pub fn poll_expired(
        &mut self,
        waker: &Waker,
    ) -> bool {
        if self.core.clock.now() >= self.at {
            self.timer = None;
            return true;
        }
        if self.timer.is_none() {
            let handle = self.core.timers.borrow_mut().schedule(self.at, waker.clone());
            self.timer = Some(handle);
        }
        false
    }
}
