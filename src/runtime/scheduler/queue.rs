//! Ready queue for the scheduler
//!
//! Wakers and external notifiers push signals into one FIFO channel; the
//! scheduler loop pops them in order. A task's waker may be used from any
//! thread, the task itself only ever runs on the scheduler's thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Wake;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use super::task::TaskId;

/// Something the scheduler loop should react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// The task is ready to be polled.
    Wake(TaskId),
    /// An event source has new events to pump.
    External,
}

/// FIFO of ready signals.
#[derive(Debug)]
pub(crate) struct ReadyQueue {
    tx: Sender<Signal>,
    rx: Receiver<Signal>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    /// Build the waker of task `id`.
    pub fn waker(
        &self,
        id: TaskId,
    ) -> Arc<TaskWaker> {
        Arc::new(TaskWaker {
            id,
            tx: self.tx.clone(),
            queued: AtomicBool::new(false),
        })
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            tx: self.tx.clone(),
        }
    }

    #[inline]
    pub fn try_pop(&self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }

    /// Block for at most `timeout` waiting for a signal.
    pub fn pop_timeout(
        &self,
        timeout: Duration,
    ) -> Option<Signal> {
        match self.rx.recv_timeout(timeout) {
            Ok(signal) => Some(signal),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Drop every queued signal.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}

/// Waker of one task.
///
/// `queued` collapses repeated wakes into a single queue entry until the
/// task is polled again.
#[derive(Debug)]
pub(crate) struct TaskWaker {
    id: TaskId,
    tx: Sender<Signal>,
    queued: AtomicBool,
}

impl TaskWaker {
    /// Called right before the task is polled; wakes from here on queue it
    /// again.
    #[inline]
    pub fn clear(&self) {
        self.queued.store(false, Ordering::Release);
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.queued.swap(true, Ordering::AcqRel) {
            // The receiver is gone once the scheduler is dropped.
            let _ = self.tx.send(Signal::Wake(self.id));
        }
    }
}

/// Thread-safe handle that wakes the scheduler loop when external events
/// (job responses, worker exits) arrive.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Sender<Signal>,
}

impl Notifier {
    /// Returns false when the scheduler no longer exists.
    pub fn notify(&self) -> bool {
        self.tx.send(Signal::External).is_ok()
    }
}
