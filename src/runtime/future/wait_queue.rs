//! Wait queues: retrieve a set of futures in completion order

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::poll_fn;
use std::rc::Rc;
use std::task::{Poll, Waker};
use std::time::Duration;

use smallvec::SmallVec;

use super::{FutureHandle, FutureId};
use crate::runtime::scheduler::{Cx, SchedulerError};

struct Inner<T> {
    pending: Vec<FutureHandle<T>>,
    /// Every future ever pushed; a future is handed out once.
    seen: HashSet<FutureId>,
    waiters: SmallVec<[Waker; 1]>,
}

impl<T> Inner<T> {
    /// Remove the resolved future with the lowest completion sequence.
    fn take_ready(&mut self) -> Option<FutureHandle<T>> {
        let (index, _) = self
            .pending
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.completion_seq().map(|seq| (i, seq)))
            .min_by_key(|&(_, seq)| seq)?;
        Some(self.pending.remove(index))
    }
}

/// A queue of futures that hands them back as they resolve.
///
/// `next` returns resolved futures ordered by when they resolved, not by
/// when they were pushed. Cloning the queue shares it, so another task can
/// `push` while one is blocked in `next`.
pub struct WaitQueue<T> {
    cx: Cx,
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for WaitQueue<T> {
    fn clone(&self) -> Self {
        Self {
            cx: self.cx.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for WaitQueue<T> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WaitQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl<T> WaitQueue<T> {
    pub fn new(
        cx: &Cx,
        futures: impl IntoIterator<Item = FutureHandle<T>>,
    ) -> Result<Self, SchedulerError> {
        let queue = Self {
            cx: cx.clone(),
            inner: Rc::new(RefCell::new(Inner {
                pending: Vec::new(),
                seen: HashSet::new(),
                waiters: SmallVec::new(),
            })),
        };
        for future in futures {
            queue.push(future)?;
        }
        Ok(queue)
    }

    /// Add a future. A future that is already in the queue, or that the
    /// queue already returned, is rejected.
    pub fn push(
        &self,
        future: FutureHandle<T>,
    ) -> Result<(), SchedulerError> {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            if !inner.seen.insert(future.id()) {
                return Err(SchedulerError::DuplicateFuture(future.id()));
            }
            inner.pending.push(future);
            std::mem::take(&mut inner.waiters)
        };
        // A task blocked in `next` must also watch the new future.
        for waker in waiters {
            waker.wake();
        }
        Ok(())
    }

    /// Futures not returned yet.
    pub fn len(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().pending.is_empty()
    }

    /// The earliest-resolved future still in the queue.
    ///
    /// Waits up to `timeout` (`None`: forever) for one to resolve. Returns
    /// `None` when the queue is empty or the timeout passed. A zero timeout
    /// only polls.
    pub async fn next(
        &self,
        timeout: Option<Duration>,
    ) -> Option<FutureHandle<T>> {
        if let Some(future) = self.inner.borrow_mut().take_ready() {
            return Some(future);
        }
        if self.is_empty() {
            return None;
        }
        let mut deadline = match timeout {
            Some(t) if t.is_zero() => return None,
            Some(t) => Some(self.cx.deadline(t)),
            None => None,
        };
        poll_fn(|task_cx| {
            let mut inner = self.inner.borrow_mut();
            if let Some(future) = inner.take_ready() {
                return Poll::Ready(Some(future));
            }
            if inner.pending.is_empty() {
                return Poll::Ready(None);
            }
            if let Some(deadline) = deadline.as_mut() {
                if deadline.poll_expired(task_cx.waker()) {
                    return Poll::Ready(None);
                }
            }
            let waker = task_cx.waker();
            if !inner.waiters.iter().any(|w| w.will_wake(waker)) {
                inner.waiters.push(waker.clone());
            }
            let pending = inner.pending.clone();
            drop(inner);
            for future in &pending {
                future.register_waker(waker);
            }
            Poll::Pending
        })
        .await
    }
}
