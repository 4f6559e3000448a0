//! Cooperative task scheduler
//!
//! One thread runs every task. A task gives up the thread only at a
//! suspension point: `yield_now`, `sleep`, `wait`, `wait_concurrently` and
//! `WaitQueue::next`. Between two suspension points it owns the world, so
//! shared state can be touched without locks, as long as no borrow is held
//! across an `.await`.
//!
//! ```
//! use tasklane::runtime::scheduler::{Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::virtual_time());
//! let total = scheduler
//!     .run(|cx| async move {
//!         let a = cx.fork(|_| async { Ok(20i64) })?;
//!         let b = cx.fork(|_| async { Ok(22i64) })?;
//!         Ok(cx.wait_concurrently(&a).await? + cx.wait_concurrently(&b).await?)
//!     })
//!     .unwrap();
//! assert_eq!(total, 42);
//! ```

pub mod queue;
pub mod task;
mod timer;

pub use queue::Notifier;
pub use task::{Task, TaskId, TaskIdGenerator, TaskState};

pub use crate::util::config::{ClockMode, SchedulerConfig};

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::future::{poll_fn, Future};
use std::panic::AssertUnwindSafe;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::runtime::future::{ErrorInfo, FutureHandle, FutureId, TaskError, WaitQueue};
use queue::{ReadyQueue, Signal};
use task::{TaskFuture, TaskSlot};
use timer::{Clock, Deadline, TimerQueue};

/// Scheduler errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("cannot fork a computation without a value; return `Done` instead")]
    ValuelessFork,

    #[error("{0} is already queued or was already retrieved")]
    DuplicateFuture(FutureId),

    #[error("deadlock: {suspended} task(s) suspended with no timer or external work pending")]
    Deadlock { suspended: usize },

    #[error("root computation failed: {0}")]
    Root(ErrorInfo),

    #[error("scheduler is already running")]
    AlreadyRunning,
}

/// Lets a computation propagate scheduler errors with `?`.
impl From<SchedulerError> for ErrorInfo {
    #[track_caller]
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Root(info) => info,
            other => ErrorInfo::from_error(&other),
        }
    }
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    forked: Cell<usize>,
    completed: Cell<usize>,
    failed: Cell<usize>,
    abandoned: Cell<usize>,
    polls: Cell<usize>,
    yields: Cell<usize>,
    timers_fired: Cell<usize>,
}

/// Point-in-time copy of `SchedulerStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Tasks forked, including the root.
    pub forked: usize,
    /// Tasks that finished with a value.
    pub completed: usize,
    /// Tasks that finished with an error or a panic.
    pub failed: usize,
    /// Tasks dropped at exit.
    pub abandoned: usize,
    pub polls: usize,
    pub yields: usize,
    pub timers_fired: usize,
}

fn bump(counter: &Cell<usize>) {
    counter.set(counter.get() + 1);
}

impl SchedulerStats {
    #[inline]
    pub fn record_forked(&self) {
        bump(&self.forked);
    }

    #[inline]
    pub fn record_completed(&self) {
        bump(&self.completed);
    }

    #[inline]
    pub fn record_failed(&self) {
        bump(&self.failed);
    }

    #[inline]
    pub fn record_abandoned(
        &self,
        count: usize,
    ) {
        self.abandoned.set(self.abandoned.get() + count);
    }

    #[inline]
    pub fn record_poll(&self) {
        bump(&self.polls);
    }

    #[inline]
    pub fn record_yield(&self) {
        bump(&self.yields);
    }

    #[inline]
    pub fn record_timers(
        &self,
        fired: usize,
    ) {
        self.timers_fired.set(self.timers_fired.get() + fired);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            forked: self.forked.get(),
            completed: self.completed.get(),
            failed: self.failed.get(),
            abandoned: self.abandoned.get(),
            polls: self.polls.get(),
            yields: self.yields.get(),
            timers_fired: self.timers_fired.get(),
        }
    }
}

/// Work that completes outside the scheduler thread, such as job responses.
///
/// Registered sources are pumped on every loop iteration. While a source
/// reports work in flight, the scheduler blocks on its notifier instead of
/// declaring a deadlock, and virtual time does not advance.
pub trait EventSource {
    /// Apply pending events, resolving futures. Returns true if anything
    /// happened.
    fn pump(
        &self,
        now: Duration,
    ) -> bool;

    /// Operations started and not yet finished.
    fn in_flight(&self) -> usize;

    /// Earliest scheduler time at which `pump` has work even without an
    /// external event (a job deadline).
    fn next_deadline(&self) -> Option<Duration>;
}

/// State shared by the scheduler and every `Cx`.
pub(crate) struct Core {
    config: SchedulerConfig,
    clock: Clock,
    tasks: RefCell<HashMap<TaskId, TaskSlot>>,
    /// Finished tasks that ended with an error.
    failed: RefCell<HashSet<TaskId>>,
    ids: TaskIdGenerator,
    ready: ReadyQueue,
    timers: RefCell<TimerQueue>,
    sources: RefCell<Vec<Weak<dyn EventSource>>>,
    wait_all_forks: Cell<bool>,
    current: Cell<Option<TaskId>>,
    running: Cell<bool>,
    stats: SchedulerStats,
}

impl Core {
    fn poll_task(
        &self,
        id: TaskId,
    ) {
        let (mut future, waker) = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(&id) else {
                // Completed already; a stale wake.
                return;
            };
            let Some(future) = slot.future.take() else {
                return;
            };
            slot.task.set_state(TaskState::Running);
            slot.task.record_poll();
            (future, slot.waker.clone())
        };

        waker.clear();
        let waker = Waker::from(waker);
        let mut cx = Context::from_waker(&waker);
        let previous = self.current.replace(Some(id));
        let poll = future.as_mut().poll(&mut cx);
        self.current.set(previous);
        self.stats.record_poll();

        match poll {
            Poll::Pending => {
                if let Some(slot) = self.tasks.borrow_mut().get_mut(&id) {
                    slot.task.set_state(TaskState::Suspended);
                    slot.future = Some(future);
                }
            }
            Poll::Ready(outcome) => {
                let slot = self.tasks.borrow_mut().remove(&id);
                let failed = outcome.is_err();
                if let Some(slot) = &slot {
                    slot.task.set_state(TaskState::Completed { failed });
                }
                match outcome {
                    Ok(()) => {
                        self.stats.record_completed();
                        trace!(task = %id, "task completed");
                    }
                    Err(info) => {
                        self.failed.borrow_mut().insert(id);
                        self.stats.record_failed();
                        debug!(task = %id, error = %info, "task failed");
                    }
                }
                // Dropped outside the borrow: destructors may fork or wake.
                drop(slot);
                drop(future);
            }
        }
    }

    fn pump_sources(
        &self,
        now: Duration,
    ) -> bool {
        let sources: Vec<_> = {
            let mut sources = self.sources.borrow_mut();
            sources.retain(|s| s.strong_count() > 0);
            sources.iter().filter_map(Weak::upgrade).collect()
        };
        let mut progressed = false;
        for source in sources {
            progressed |= source.pump(now);
        }
        progressed
    }

    fn external_state(&self) -> (usize, Option<Duration>) {
        let sources: Vec<_> = self.sources.borrow().iter().filter_map(Weak::upgrade).collect();
        let in_flight = sources.iter().map(|s| s.in_flight()).sum();
        let deadline = sources.iter().filter_map(|s| s.next_deadline()).min();
        (in_flight, deadline)
    }

    /// Nothing is ready: block until a timer, an external event or a wake.
    fn idle(&self) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        let timer = self.timers.borrow_mut().next_deadline();
        let (in_flight, source_deadline) = self.external_state();
        let next = match (timer, source_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if in_flight == 0 {
            match next {
                None => {
                    return Err(SchedulerError::Deadlock {
                        suspended: self.tasks.borrow().len(),
                    })
                }
                Some(at) if self.clock.is_virtual() => {
                    trace!(from = ?now, to = ?at, "advancing virtual clock");
                    self.clock.advance_to(at);
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let wait = match next {
            Some(at) if !self.clock.is_virtual() => at.saturating_sub(now),
            _ => self.config.idle_slice(),
        };
        if let Some(Signal::Wake(id)) = self.ready.pop_timeout(wait) {
            self.poll_task(id);
        }
        Ok(())
    }

    /// Run the loop until `done` holds.
    fn drive(
        &self,
        done: impl Fn(&Core) -> bool,
    ) -> Result<(), SchedulerError> {
        loop {
            if done(self) {
                return Ok(());
            }
            let now = self.clock.now();
            let fired = self.timers.borrow_mut().fire(now);
            self.stats.record_timers(fired);
            let mut progressed = fired > 0;
            progressed |= self.pump_sources(now);

            // Only what is queued now: tasks that yield go behind this batch,
            // so timers and sources are serviced between rounds.
            let batch = self.ready.len();
            for _ in 0..batch {
                match self.ready.try_pop() {
                    Some(Signal::Wake(id)) => {
                        self.poll_task(id);
                        progressed = true;
                    }
                    Some(Signal::External) => {}
                    None => break,
                }
                if done(self) {
                    return Ok(());
                }
            }

            if progressed || self.ready.len() > 0 {
                continue;
            }
            self.idle()?;
        }
    }

    /// Drop every remaining task. Their errors, if any, are never observed.
    fn abandon_all(&self) -> usize {
        let tasks = std::mem::take(&mut *self.tasks.borrow_mut());
        let count = tasks.len();
        if count > 0 {
            self.stats.record_abandoned(count);
            debug!(count, "abandoning unfinished tasks");
        }
        drop(tasks);
        self.timers.borrow_mut().clear();
        self.ready.clear();
        count
    }
}

/// The scheduler.
pub struct Scheduler {
    core: Rc<Core>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.core.config)
            .field("tasks", &self.core.tasks.borrow().len())
            .field("stats", &self.core.stats.snapshot())
            .finish()
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let core = Rc::new(Core {
            clock: Clock::new(config.clock),
            wait_all_forks: Cell::new(config.wait_all_forks_on_finish),
            config,
            tasks: RefCell::new(HashMap::new()),
            failed: RefCell::new(HashSet::new()),
            ids: TaskIdGenerator::new(),
            ready: ReadyQueue::new(),
            timers: RefCell::new(TimerQueue::default()),
            sources: RefCell::new(Vec::new()),
            current: Cell::new(None),
            running: Cell::new(false),
            stats: SchedulerStats::default(),
        });
        Self { core }
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Run `root` to completion and return its value.
    ///
    /// When the root finishes, remaining forks are either drained or
    /// abandoned, per `set_wait_all_forks_on_finish`. A root that fails
    /// surfaces as `SchedulerError::Root`.
    pub fn run<F, Fut, T>(
        &self,
        root: F,
    ) -> Result<T, SchedulerError>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = Result<T, ErrorInfo>> + 'static,
        T: 'static,
    {
        if self.core.running.replace(true) {
            return Err(SchedulerError::AlreadyRunning);
        }
        let cx = Cx {
            core: self.core.clone(),
        };
        let handle = cx.spawn(Some("root".to_string()), root);
        debug!(clock = ?self.core.config.clock, "scheduler started");

        let result = self.core.drive(|_| handle.is_resolved());
        let result = result.and_then(|()| {
            if !self.core.wait_all_forks.get() {
                return Ok(());
            }
            match self.core.drive(|core| core.tasks.borrow().is_empty()) {
                Err(SchedulerError::Deadlock { suspended }) => {
                    warn!(suspended, "forks can never finish; abandoning them");
                    Ok(())
                }
                other => other,
            }
        });
        self.core.abandon_all();
        self.core.running.set(false);
        result?;

        let stats = self.core.stats.snapshot();
        debug!(forked = stats.forked, polls = stats.polls, "scheduler finished");
        match handle.take_outcome() {
            Some(Ok(value)) => Ok(value),
            Some(Err(info)) => Err(SchedulerError::Root(info)),
            None => Err(SchedulerError::Deadlock { suspended: 0 }),
        }
    }
}

/// Explicit scheduler context handed to every computation.
///
/// Cheap to clone. Only valid on the scheduler's thread.
#[derive(Clone)]
pub struct Cx {
    core: Rc<Core>,
}

impl std::fmt::Debug for Cx {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Cx")
            .field("current", &self.core.current.get())
            .finish()
    }
}

impl Cx {
    fn spawn<F, Fut, T>(
        &self,
        name: Option<String>,
        computation: F,
    ) -> FutureHandle<T>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = Result<T, ErrorInfo>> + 'static,
        T: 'static,
    {
        let (resolver, handle) = FutureHandle::channel();
        let id = self.core.ids.next();
        let body = computation(self.clone());
        let future: TaskFuture = Box::pin(async move {
            let outcome = match AssertUnwindSafe(body).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => Err(ErrorInfo::from_panic(payload)),
            };
            let status = match &outcome {
                Ok(_) => Ok(()),
                Err(info) => Err(info.clone()),
            };
            resolver.resolve(outcome);
            status
        });

        let waker = self.core.ready.waker(id);
        let task = Task::new(id, name, self.core.clock.now());
        trace!(task = %id, name = task.name(), "forked");
        self.core.tasks.borrow_mut().insert(
            id,
            TaskSlot {
                task,
                future: Some(future),
                waker: waker.clone(),
            },
        );
        self.core.stats.record_forked();
        Waker::from(waker).wake();
        handle
    }

    /// Fork `computation` as a new task.
    ///
    /// The task does not run before the caller reaches a suspension point.
    /// Computations without a value (`T = ()`) are rejected; return `Done`.
    pub fn fork<F, Fut, T>(
        &self,
        computation: F,
    ) -> Result<FutureHandle<T>, SchedulerError>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = Result<T, ErrorInfo>> + 'static,
        T: 'static,
    {
        self.fork_inner(None, computation)
    }

    /// `fork` with a task name for logs.
    pub fn fork_named<F, Fut, T>(
        &self,
        name: impl Into<String>,
        computation: F,
    ) -> Result<FutureHandle<T>, SchedulerError>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = Result<T, ErrorInfo>> + 'static,
        T: 'static,
    {
        self.fork_inner(Some(name.into()), computation)
    }

    fn fork_inner<F, Fut, T>(
        &self,
        name: Option<String>,
        computation: F,
    ) -> Result<FutureHandle<T>, SchedulerError>
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = Result<T, ErrorInfo>> + 'static,
        T: 'static,
    {
        if TypeId::of::<T>() == TypeId::of::<()>() {
            return Err(SchedulerError::ValuelessFork);
        }
        Ok(self.spawn(name, computation))
    }

    /// Suspend and go to the back of the ready queue.
    pub async fn yield_now(&self) {
        self.core.stats.record_yield();
        let mut yielded = false;
        poll_fn(|task_cx| {
            if yielded {
                return Poll::Ready(());
            }
            yielded = true;
            task_cx.waker().wake_by_ref();
            Poll::Pending
        })
        .await
    }

    /// Suspend until `duration` of scheduler time has passed. A zero duration
    /// is a plain `yield_now`.
    pub async fn sleep(
        &self,
        duration: Duration,
    ) {
        if duration.is_zero() {
            return self.yield_now().await;
        }
        let mut deadline = Deadline::after(&self.core, duration);
        poll_fn(|task_cx| {
            if deadline.poll_expired(task_cx.waker()) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Wait for `future` for at most `timeout` (`None`: forever).
    ///
    /// Returns `Ok(None)` on timeout; the awaited computation keeps running.
    /// A zero timeout only polls and never suspends.
    pub async fn wait<T: Clone>(
        &self,
        future: &FutureHandle<T>,
        timeout: Option<Duration>,
    ) -> Result<Option<T>, TaskError> {
        if let Some(result) = future.retrieve() {
            return result.map(Some);
        }
        let mut deadline = match timeout {
            Some(t) if t.is_zero() => return Ok(None),
            Some(t) => Some(Deadline::after(&self.core, t)),
            None => None,
        };
        poll_fn(|task_cx| {
            if let Some(result) = future.retrieve() {
                return Poll::Ready(result.map(Some));
            }
            if let Some(deadline) = deadline.as_mut() {
                if deadline.poll_expired(task_cx.waker()) {
                    return Poll::Ready(Ok(None));
                }
            }
            future.register_waker(task_cx.waker());
            Poll::Pending
        })
        .await
    }

    /// Wait for `future` with no timeout.
    pub async fn wait_concurrently<T: Clone>(
        &self,
        future: &FutureHandle<T>,
    ) -> Result<T, TaskError> {
        poll_fn(|task_cx| match future.retrieve() {
            Some(result) => Poll::Ready(result),
            None => {
                future.register_waker(task_cx.waker());
                Poll::Pending
            }
        })
        .await
    }

    /// Create a wait queue over `futures`.
    pub fn wait_queue<T>(
        &self,
        futures: impl IntoIterator<Item = FutureHandle<T>>,
    ) -> Result<WaitQueue<T>, SchedulerError> {
        WaitQueue::new(self, futures)
    }

    /// Choose the exit policy: drain every fork when the root finishes
    /// (`true`) or abandon them (`false`).
    pub fn set_wait_all_forks_on_finish(
        &self,
        wait: bool,
    ) {
        self.core.wait_all_forks.set(wait);
    }

    pub fn wait_all_forks_on_finish(&self) -> bool {
        self.core.wait_all_forks.get()
    }

    /// Current scheduler time.
    #[inline]
    pub fn now(&self) -> Duration {
        self.core.clock.now()
    }

    /// Task being polled right now.
    #[inline]
    pub fn current_task(&self) -> Option<TaskId> {
        self.core.current.get()
    }

    /// State of a task; `None` for ids this scheduler never issued.
    pub fn task_state(
        &self,
        id: TaskId,
    ) -> Option<TaskState> {
        if let Some(slot) = self.core.tasks.borrow().get(&id) {
            return Some(slot.task.state());
        }
        let failed = self.core.failed.borrow().contains(&id);
        self.core
            .ids
            .issued(id)
            .then_some(TaskState::Completed { failed })
    }

    /// Tasks that have not finished yet, including the caller.
    pub fn task_count(&self) -> usize {
        self.core.tasks.borrow().len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.core.config
    }

    /// A `Send` handle that wakes the scheduler from another thread.
    pub fn notifier(&self) -> Notifier {
        self.core.ready.notifier()
    }

    /// Pump `source` on every loop iteration until it is dropped.
    pub fn register_source(
        &self,
        source: Weak<dyn EventSource>,
    ) {
        self.core.sources.borrow_mut().push(source);
    }

    pub(crate) fn deadline(
        &self,
        timeout: Duration,
    ) -> Deadline {
        Deadline::after(&self.core, timeout)
    }
}

#[cfg(test)]
mod tests;
