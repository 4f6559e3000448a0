//! Job workers
//!
//! `JobDispatcher` sends `JobRequest`s to a pool of worker processes (or
//! threads) and hands back a `JobHandle` whose future resolves with the
//! worker's `JobResponse`. Requests may carry a `ContextRef` to an immutable
//! shared-memory context; the dispatcher holds one reference on it per job
//! and drops it when the response is retrieved or the job is abandoned.
//!
//! The dispatcher is an `EventSource`: the scheduler pumps it every loop
//! iteration, which applies worker responses, expires timed-out jobs and
//! dispatches queued ones.

mod builtin;
pub mod codec;
mod pool;
pub mod request;
pub mod worker;

pub use codec::{CodecError, Frame};
pub use request::{JobRequest, JobResponse};
pub use worker::{run_job, serve, JobHandler, JobRegistry, JobScope, WorkerError};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::runtime::future::{ErrorInfo, FutureHandle, Release, Resolver, TaskError};
use crate::runtime::memory::{ContextManager, ContextRef, MemoryError};
use crate::runtime::scheduler::{Cx, EventSource};
use crate::util::config::{ArenaConfig, JobConfig};
use pool::{WorkerEvent, WorkerPool};

/// Errors starting the dispatcher or its workers.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("worker I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("worker failed to start: {0}")]
    Worker(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Why a job could not be started.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("job queue is full ({capacity} jobs waiting)")]
    Saturated { capacity: usize },

    #[error("cannot encode request: {0}")]
    Encode(#[from] CodecError),

    #[error("cannot attach context: {0}")]
    Context(#[from] MemoryError),

    #[error("no live workers")]
    NoWorkers,
}

/// Lets a computation propagate dispatch failures with `?`.
impl From<DispatchError> for ErrorInfo {
    #[track_caller]
    fn from(err: DispatchError) -> Self {
        ErrorInfo::from_error(&err)
    }
}

/// Lifecycle of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPhase {
    /// Accepted, waiting for a free worker.
    Submitted,
    /// Sent to a worker.
    Dispatched,
    /// The response arrived and resolved the job's future.
    ResponseStored,
    /// A waiter received the response.
    Retrieved,
    /// Timed out, lost, or dropped without being retrieved.
    Abandoned,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobStats {
    pub submitted: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub timed_out: usize,
    pub lost: usize,
    pub rejected: usize,
    /// Responses that arrived after their job timed out.
    pub late_responses: usize,
}

/// One job's reference on its context. Released at most once.
struct ContextLease {
    contexts: ContextManager,
    ctx: ContextRef,
    released: Cell<bool>,
}

impl ContextLease {
    fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        match self.contexts.detach(&self.ctx) {
            Ok(refcount) => trace!(slot = self.ctx.slot, refcount, "job released context"),
            Err(e) => warn!(slot = self.ctx.slot, error = %e, "failed to detach context"),
        }
    }
}

/// Handle to a started job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: u64,
    future: FutureHandle<JobResponse>,
    phase: Rc<Cell<JobPhase>>,
}

impl JobHandle {
    #[inline]
    pub fn id(&self) -> u64 {
        self.job_id
    }

    /// The job's future, for `Cx::wait` or a `WaitQueue`.
    #[inline]
    pub fn future(&self) -> &FutureHandle<JobResponse> {
        &self.future
    }

    pub fn phase(&self) -> JobPhase {
        self.phase.get()
    }

    /// Wait for the response; same semantics as `Cx::wait`.
    pub async fn wait(
        &self,
        cx: &Cx,
        timeout: Option<Duration>,
    ) -> Result<Option<JobResponse>, TaskError> {
        cx.wait(&self.future, timeout).await
    }
}

struct JobEntry {
    phase: Rc<Cell<JobPhase>>,
    deadline: Option<Instant>,
    resolver: Resolver<JobResponse>,
    /// Encoded `Request` frame; taken when the job is sent.
    body: Option<Vec<u8>>,
    lease: Option<Rc<ContextLease>>,
}

impl JobEntry {
    /// Resolve without a worker response.
    fn abandon(
        self,
        kind: &str,
        message: String,
    ) -> (Resolver<JobResponse>, JobResponse) {
        self.phase.set(JobPhase::Abandoned);
        if let Some(lease) = &self.lease {
            lease.release();
        }
        (self.resolver, JobResponse::error(kind, message))
    }
}

type Resolution = (Resolver<JobResponse>, JobResponse);

/// `Instant::now() + timeout`, or `None` when that is past what the clock
/// can represent.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

struct DispatchState {
    pool: WorkerPool,
    /// Jobs whose future is not resolved yet, in submission order.
    jobs: IndexMap<u64, JobEntry>,
    queue: VecDeque<u64>,
    next_job_id: u64,
}

// Field order matters: the pool shuts down before the arena is unmapped.
struct DispatcherInner {
    cx: Cx,
    config: JobConfig,
    state: RefCell<DispatchState>,
    contexts: ContextManager,
    stats: Cell<JobStats>,
}

/// Sends jobs to worker processes and tracks their responses.
///
/// Dropping the dispatcher shuts the workers down; jobs still running
/// resolve with a `cancelled` error.
pub struct JobDispatcher {
    inner: Rc<DispatcherInner>,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("workers", &self.workers_count())
            .field("in_flight", &self.in_flight())
            .field("queued", &self.queued())
            .finish()
    }
}

impl JobDispatcher {
    /// Create the arena, start the workers with the built-in handlers and
    /// register with the scheduler of `cx`.
    pub fn spawn(
        cx: &Cx,
        config: JobConfig,
        arena: ArenaConfig,
    ) -> Result<Self, JobError> {
        Self::spawn_with(cx, config, arena, Arc::new(JobRegistry::with_builtins()))
    }

    /// `spawn` with a custom handler registry. Only thread workers use it;
    /// worker processes build their own.
    pub fn spawn_with(
        cx: &Cx,
        config: JobConfig,
        arena: ArenaConfig,
        registry: Arc<JobRegistry>,
    ) -> Result<Self, JobError> {
        if config.workers == 0 {
            return Err(JobError::Worker("at least one worker is required".to_string()));
        }
        let contexts = ContextManager::create(&arena)?;
        let pool = WorkerPool::spawn(&config, contexts.arena().path(), registry, cx.notifier())?;
        let inner = Rc::new(DispatcherInner {
            cx: cx.clone(),
            config,
            state: RefCell::new(DispatchState {
                pool,
                jobs: IndexMap::new(),
                queue: VecDeque::new(),
                next_job_id: 1,
            }),
            contexts,
            stats: Cell::new(JobStats::default()),
        });
        let source: Weak<dyn EventSource> = Rc::downgrade(&inner) as Weak<dyn EventSource>;
        cx.register_source(source);
        info!(
            workers = inner.config.workers,
            arena = %inner.contexts.arena().path().display(),
            "job dispatcher started"
        );
        Ok(Self { inner })
    }

    /// Publishes and reads contexts in the dispatcher's arena.
    #[inline]
    pub fn contexts(&self) -> &ContextManager {
        &self.inner.contexts
    }

    #[inline]
    pub fn config(&self) -> &JobConfig {
        &self.inner.config
    }

    /// Live workers.
    pub fn workers_count(&self) -> usize {
        self.inner.state.borrow().pool.alive_count()
    }

    /// Jobs started whose response has not arrived.
    pub fn in_flight(&self) -> usize {
        self.inner.state.borrow().jobs.len()
    }

    /// Jobs waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    pub fn stats(&self) -> JobStats {
        self.inner.stats.get()
    }

    /// Start a job. `timeout` (or the configured default) is measured from
    /// now and includes time spent waiting for a worker.
    ///
    /// On success the request's context, if any, gains one reference that
    /// the job holds until its response is retrieved or abandoned.
    pub fn start(
        &self,
        request: JobRequest,
        timeout: Option<Duration>,
    ) -> Result<JobHandle, DispatchError> {
        let result = self.inner.start(request, timeout);
        if let Err(e) = &result {
            self.inner.record(|s| s.rejected += 1);
            debug!(error = %e, "job rejected");
        }
        result
    }

    /// Start several jobs. Results are in input order; each submission
    /// succeeds or fails on its own.
    pub fn start_multi(
        &self,
        requests: impl IntoIterator<Item = JobRequest>,
        timeout: Option<Duration>,
    ) -> Vec<Result<JobHandle, DispatchError>> {
        requests
            .into_iter()
            .map(|request| self.start(request, timeout))
            .collect()
    }
}

impl DispatcherInner {
    fn record(
        &self,
        update: impl FnOnce(&mut JobStats),
    ) {
        let mut stats = self.stats.get();
        update(&mut stats);
        self.stats.set(stats);
    }

    fn start(
        &self,
        request: JobRequest,
        timeout: Option<Duration>,
    ) -> Result<JobHandle, DispatchError> {
        let timeout = timeout.or(self.config.default_timeout());
        let mut state = self.state.borrow_mut();
        if state.pool.alive_count() == 0 {
            return Err(DispatchError::NoWorkers);
        }
        if state.pool.idle_worker().is_none() && state.queue.len() >= self.config.queue_capacity {
            return Err(DispatchError::Saturated {
                capacity: self.config.queue_capacity,
            });
        }

        let job_id = state.next_job_id;
        let context = request.context;
        let tag = request.type_tag.clone();
        let body = Frame::Request {
            job_id,
            request,
            timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        }
        .to_body()?;
        let lease = match context {
            Some(ctx) => {
                self.contexts.attach(&ctx)?;
                Some(Rc::new(ContextLease {
                    contexts: self.contexts.clone(),
                    ctx,
                    released: Cell::new(false),
                }))
            }
            None => None,
        };
        state.next_job_id += 1;

        let (resolver, future) = FutureHandle::channel();
        let phase = Rc::new(Cell::new(JobPhase::Submitted));
        let hook_phase = phase.clone();
        let hook_lease = lease.clone();
        future.set_on_release(Box::new(move |release| {
            match release {
                Release::Retrieved if hook_phase.get() != JobPhase::Abandoned => {
                    hook_phase.set(JobPhase::Retrieved)
                }
                Release::Dropped if hook_phase.get() != JobPhase::Retrieved => {
                    hook_phase.set(JobPhase::Abandoned)
                }
                _ => {}
            }
            if let Some(lease) = hook_lease {
                lease.release();
            }
        }));

        state.jobs.insert(
            job_id,
            JobEntry {
                phase: phase.clone(),
                deadline: timeout.and_then(deadline_after),
                resolver,
                body: Some(body),
                lease,
            },
        );
        state.queue.push_back(job_id);
        self.record(|s| s.submitted += 1);
        trace!(job_id, %tag, ?timeout, "job submitted");

        let resolutions = self.dispatch_queued(&mut state);
        drop(state);
        resolve_all(resolutions);
        Ok(JobHandle {
            job_id,
            future,
            phase,
        })
    }

    /// Send queued jobs to idle workers. Fails every job still waiting once
    /// no worker is left.
    fn dispatch_queued(
        &self,
        state: &mut DispatchState,
    ) -> Vec<Resolution> {
        let mut resolutions = Vec::new();
        while let Some(worker) = state.pool.idle_worker() {
            let Some(job_id) = state.queue.pop_front() else {
                break;
            };
            let Some(entry) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            let Some(body) = entry.body.take() else {
                continue;
            };
            match state.pool.send_job(worker, job_id, &body) {
                Ok(()) => {
                    entry.phase.set(JobPhase::Dispatched);
                    self.record(|s| s.dispatched += 1);
                    trace!(job_id, worker, "job dispatched");
                }
                Err(CodecError::Io(e)) => {
                    warn!(worker, error = %e, "cannot write to worker; dropping it");
                    entry.body = Some(body);
                    state.queue.push_front(job_id);
                    state.pool.mark_lost(worker);
                }
                // Nothing reached the worker: the job fails, the worker stays.
                Err(e) => {
                    warn!(job_id, error = %e, "job frame rejected");
                    if let Some(entry) = state.jobs.shift_remove(&job_id) {
                        self.record(|s| s.rejected += 1);
                        resolutions.push(entry.abandon("encode_error", e.to_string()));
                    }
                }
            }
        }

        if state.pool.alive_count() > 0 || state.queue.is_empty() {
            return resolutions;
        }
        let stranded: Vec<u64> = state.queue.drain(..).collect();
        for job_id in stranded {
            if let Some(entry) = state.jobs.shift_remove(&job_id) {
                self.record(|s| s.lost += 1);
                resolutions.push(entry.abandon("worker_lost", "no live workers left".to_string()));
            }
        }
        resolutions
    }

    fn apply_event(
        &self,
        state: &mut DispatchState,
        event: WorkerEvent,
        resolutions: &mut Vec<Resolution>,
    ) {
        match event {
            WorkerEvent::Ready { worker, pid } => {
                debug!(worker, pid, "worker ready");
            }
            WorkerEvent::Response {
                worker,
                job_id,
                response,
            } => {
                state.pool.release(worker);
                match state.jobs.shift_remove(&job_id) {
                    Some(entry) => {
                        entry.phase.set(JobPhase::ResponseStored);
                        self.record(|s| s.completed += 1);
                        trace!(job_id, worker, success = response.is_success(), "job response");
                        resolutions.push((entry.resolver, response));
                    }
                    None => {
                        self.record(|s| s.late_responses += 1);
                        debug!(job_id, worker, "discarding late response");
                    }
                }
            }
            WorkerEvent::Lost { worker, reason } => {
                let job = state.pool.mark_lost(worker);
                warn!(worker, %reason, job = ?job, "worker lost");
                if let Some(entry) = job.and_then(|id| state.jobs.shift_remove(&id)) {
                    self.record(|s| s.lost += 1);
                    resolutions.push(entry.abandon(
                        "worker_lost",
                        format!("worker {worker} exited: {reason}"),
                    ));
                }
            }
        }
    }

    /// Resolve jobs whose deadline passed. Their worker stays busy until the
    /// late response arrives.
    fn expire(
        &self,
        state: &mut DispatchState,
        resolutions: &mut Vec<Resolution>,
    ) {
        let now = Instant::now();
        let expired: Vec<u64> = state
            .jobs
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
            .map(|(&id, _)| id)
            .collect();
        for job_id in expired {
            let Some(entry) = state.jobs.shift_remove(&job_id) else {
                continue;
            };
            state.queue.retain(|&id| id != job_id);
            self.record(|s| s.timed_out += 1);
            debug!(job_id, "job timed out");
            resolutions.push(entry.abandon("timeout", format!("job {job_id} timed out")));
        }
    }
}

fn resolve_all(resolutions: Vec<Resolution>) {
    for (resolver, response) in resolutions {
        resolver.resolve(Ok(response));
    }
}

impl EventSource for DispatcherInner {
    fn pump(
        &self,
        _now: Duration,
    ) -> bool {
        let resolutions = {
            let mut state = self.state.borrow_mut();
            let mut resolutions = Vec::new();
            let mut events = 0;
            while let Some(event) = state.pool.try_event() {
                self.apply_event(&mut state, event, &mut resolutions);
                events += 1;
            }
            self.expire(&mut state, &mut resolutions);
            resolutions.extend(self.dispatch_queued(&mut state));
            if events == 0 && resolutions.is_empty() {
                return false;
            }
            resolutions
        };
        // Resolving wakes tasks and may run release hooks; no borrow held.
        resolve_all(resolutions);
        true
    }

    fn in_flight(&self) -> usize {
        self.state.borrow().jobs.len()
    }

    fn next_deadline(&self) -> Option<Duration> {
        let state = self.state.borrow();
        let earliest = state.jobs.values().filter_map(|e| e.deadline).min()?;
        let now = Instant::now();
        Some(self.cx.now().saturating_add(earliest.saturating_duration_since(now)))
    }
}

#[cfg(test)]
mod tests;
