//! Task definitions for the scheduler.
//!
//! A task is a forked computation: a boxed future plus bookkeeping. Tasks are
//! created by `Cx::fork`, driven by the scheduler loop and removed from the
//! task table as soon as they complete.

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use futures::future::LocalBoxFuture;

use super::queue::TaskWaker;
use crate::runtime::future::ErrorInfo;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TaskId {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Forked but not polled yet.
    Pending,
    /// Currently being polled.
    Running,
    /// Waiting for a future, a timer or a yield to come around.
    Suspended,
    /// Finished. `failed` when the computation produced an error.
    Completed { failed: bool },
}

/// The computation driven by the scheduler. Its output only reports success
/// or failure; the value itself goes to the task's future.
pub(crate) type TaskFuture = LocalBoxFuture<'static, Result<(), ErrorInfo>>;

/// A forked computation.
pub struct Task {
    /// Unique task ID.
    id: TaskId,
    /// Task name for debugging.
    name: String,
    /// Current state.
    state: Cell<TaskState>,
    /// Times the task was polled.
    polls: Cell<u64>,
    /// Scheduler time at fork.
    forked_at: Duration,
}

impl std::fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("polls", &self.polls())
            .finish()
    }
}

impl Task {
    pub fn new(
        id: TaskId,
        name: Option<String>,
        forked_at: Duration,
    ) -> Self {
        Self {
            id,
            name: name.unwrap_or_else(|| id.to_string()),
            state: Cell::new(TaskState::Pending),
            polls: Cell::new(0),
            forked_at,
        }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    #[inline]
    pub fn set_state(
        &self,
        state: TaskState,
    ) {
        self.state.set(state);
    }

    #[inline]
    pub fn polls(&self) -> u64 {
        self.polls.get()
    }

    #[inline]
    pub fn record_poll(&self) {
        self.polls.set(self.polls.get() + 1);
    }

    #[inline]
    pub fn forked_at(&self) -> Duration {
        self.forked_at
    }
}

/// Entry in the scheduler's task table.
pub(crate) struct TaskSlot {
    pub task: Task,
    /// `None` while the task is being polled.
    pub future: Option<TaskFuture>,
    pub waker: Arc<TaskWaker>,
}

/// Generator for task IDs.
#[derive(Debug)]
pub struct TaskIdGenerator {
    next_id: Cell<u64>,
}

impl TaskIdGenerator {
    #[inline]
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(0),
        }
    }

    /// Generate the next task ID.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> TaskId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        TaskId(id)
    }

    /// Whether `id` was handed out by this generator.
    #[inline]
    pub fn issued(
        &self,
        id: TaskId,
    ) -> bool {
        id.0 < self.next_id.get()
    }
}

impl Default for TaskIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
