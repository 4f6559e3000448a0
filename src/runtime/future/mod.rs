//! Futures: placeholders for results that are not available yet
//!
//! A `FutureHandle<T>` is created by `fork`, by the job dispatcher, or by
//! `FutureHandle::channel`. It is resolved exactly once through its
//! `Resolver`; after that it holds either a value or an `ErrorInfo`.
//!
//! Retrieval is idempotent for values: every `wait` on a resolved future
//! returns a clone of the value. An error is *raised* to the first waiter and
//! reported as a plain `TaskError::Failed` to everyone after.

mod error;
mod wait_queue;

pub use error::{ErrorInfo, Origin, Raise, TaskError};
pub use wait_queue::WaitQueue;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Waker;

use smallvec::SmallVec;

/// Global counters. Completion sequence numbers are ordered across every
/// scheduler in the process.
static NEXT_FUTURE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_COMPLETION: AtomicU64 = AtomicU64::new(1);

/// Unique future identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FutureId(pub u64);

impl FutureId {
    fn next() -> Self {
        Self(NEXT_FUTURE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FutureId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Future({})", self.0)
    }
}

/// Sentinel value for computations that have nothing to return.
///
/// Forking a computation whose value type is `()` is rejected; return `Done`
/// instead so the wait site has something to compare against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Done;

/// Why a future's release hook ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// A waiter received the outcome.
    Retrieved,
    /// Every handle went away first.
    Dropped,
}

type ReleaseHook = Box<dyn FnOnce(Release)>;

struct FutureState<T> {
    outcome: Option<Result<T, ErrorInfo>>,
    completed_at: Option<u64>,
    error_raised: bool,
    retrieved: bool,
    waiters: SmallVec<[Waker; 2]>,
    on_release: Option<ReleaseHook>,
}

impl<T> Drop for FutureState<T> {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook(Release::Dropped);
        }
    }
}

struct FutureCell<T> {
    id: FutureId,
    state: RefCell<FutureState<T>>,
}

/// Handle to the eventual result of a computation.
///
/// Cloning the handle shares the same underlying result.
pub struct FutureHandle<T> {
    inner: Rc<FutureCell<T>>,
}

impl<T> Clone for FutureHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for FutureHandle<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("FutureHandle")
            .field("id", &self.inner.id)
            .field("resolved", &state.outcome.is_some())
            .field("completed_at", &state.completed_at)
            .finish()
    }
}

impl<T> FutureHandle<T> {
    /// Create an unresolved future and the one-shot resolver that completes it.
    pub fn channel() -> (Resolver<T>, FutureHandle<T>) {
        let inner = Rc::new(FutureCell {
            id: FutureId::next(),
            state: RefCell::new(FutureState {
                outcome: None,
                completed_at: None,
                error_raised: false,
                retrieved: false,
                waiters: SmallVec::new(),
                on_release: None,
            }),
        });
        (
            Resolver {
                inner: Some(inner.clone()),
            },
            FutureHandle { inner },
        )
    }

    #[inline]
    pub fn id(&self) -> FutureId {
        self.inner.id
    }

    /// Whether the computation has finished, successfully or not.
    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.inner.state.borrow().outcome.is_some()
    }

    /// Whether the stored outcome is an error.
    pub fn is_failed(&self) -> bool {
        matches!(self.inner.state.borrow().outcome, Some(Err(_)))
    }

    /// Sequence number assigned at resolution; lower resolved earlier.
    #[inline]
    pub fn completion_seq(&self) -> Option<u64> {
        self.inner.state.borrow().completed_at
    }

    /// Whether a waiter has already received the outcome.
    pub fn is_retrieved(&self) -> bool {
        self.inner.state.borrow().retrieved
    }

    /// Whether two handles refer to the same future.
    pub fn same(
        &self,
        other: &FutureHandle<T>,
    ) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `hook` once, when the outcome is first retrieved or when the last
    /// handle goes away, whichever happens first.
    pub(crate) fn set_on_release(
        &self,
        hook: ReleaseHook,
    ) {
        self.inner.state.borrow_mut().on_release = Some(hook);
    }

    /// Wake `waker` on resolution. A waker already registered is not added
    /// twice.
    pub(crate) fn register_waker(
        &self,
        waker: &Waker,
    ) {
        let mut state = self.inner.state.borrow_mut();
        if state.outcome.is_some() {
            drop(state);
            waker.wake_by_ref();
            return;
        }
        if !state.waiters.iter().any(|w| w.will_wake(waker)) {
            state.waiters.push(waker.clone());
        }
    }

    /// Move the outcome out. Only the scheduler does this, for the root task.
    pub(crate) fn take_outcome(&self) -> Option<Result<T, ErrorInfo>> {
        let mut state = self.inner.state.borrow_mut();
        let outcome = state.outcome.take();
        let hook = match outcome {
            Some(_) => {
                state.retrieved = true;
                state.on_release.take()
            }
            None => None,
        };
        drop(state);
        if let Some(hook) = hook {
            hook(Release::Retrieved);
        }
        outcome
    }
}

impl<T: Clone> FutureHandle<T> {
    /// Retrieve the outcome if resolved.
    ///
    /// The first retrieval of an error raises it; later ones report it as a
    /// value.
    pub(crate) fn retrieve(&self) -> Option<Result<T, TaskError>> {
        let mut state = self.inner.state.borrow_mut();
        let outcome = state.outcome.clone()?;
        let result = match outcome {
            Ok(value) => Ok(value),
            Err(info) if state.error_raised => Err(TaskError::Failed(info)),
            Err(info) => {
                state.error_raised = true;
                Err(TaskError::Raised(info))
            }
        };
        state.retrieved = true;
        let hook = state.on_release.take();
        drop(state);
        if let Some(hook) = hook {
            hook(Release::Retrieved);
        }
        Some(result)
    }
}

/// Write side of a future. Consumed by `resolve`, so a future is resolved
/// at most once.
///
/// Dropping an unused resolver resolves the future with a `cancelled` error,
/// so waiters are never stranded.
pub struct Resolver<T> {
    inner: Option<Rc<FutureCell<T>>>,
}

impl<T> Resolver<T> {
    #[inline]
    pub fn id(&self) -> Option<FutureId> {
        self.inner.as_ref().map(|cell| cell.id)
    }

    /// Store the outcome and wake every waiter.
    pub fn resolve(
        mut self,
        outcome: Result<T, ErrorInfo>,
    ) {
        self.complete(outcome);
    }

    fn complete(
        &mut self,
        outcome: Result<T, ErrorInfo>,
    ) {
        let Some(cell) = self.inner.take() else {
            return;
        };
        let waiters = {
            let mut state = cell.state.borrow_mut();
            state.outcome = Some(outcome);
            state.completed_at = Some(NEXT_COMPLETION.fetch_add(1, Ordering::Relaxed));
            std::mem::take(&mut state.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.complete(Err(ErrorInfo {
                kind: "cancelled".to_string(),
                message: "computation dropped before it produced a result".to_string(),
                origin: Origin::unknown(),
            }));
        }
    }
}

#[cfg(test)]
mod tests;
