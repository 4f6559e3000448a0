//! Worker side: handler registry and the serve loop
//!
//! A worker reads `Request` frames, runs the handler registered for the
//! request's type tag and writes back exactly one `Response` per request.
//! Handlers see their job through a `JobScope`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::codec::{self, read_frame, write_frame, CodecError, Frame};
use super::deadline_after;
use super::request::{JobRequest, JobResponse};
use crate::runtime::future::{ErrorInfo, Origin};
use crate::runtime::memory::{ContextRef, ContextView, MemoryError, SharedArena};

/// Worker errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("a response was already stored for this job")]
    ResponseAlreadyStored,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<WorkerError> for ErrorInfo {
    #[track_caller]
    fn from(err: WorkerError) -> Self {
        ErrorInfo::from_error(&err)
    }
}

/// Something that can run a job.
pub trait JobHandler: Send + Sync {
    fn handle(
        &self,
        scope: &mut JobScope<'_>,
    ) -> Result<(), ErrorInfo>;
}

impl<F> JobHandler for F
where
    F: Fn(&mut JobScope<'_>) -> Result<(), ErrorInfo> + Send + Sync,
{
    fn handle(
        &self,
        scope: &mut JobScope<'_>,
    ) -> Result<(), ErrorInfo> {
        self(scope)
    }
}

/// Handlers by type tag.
#[derive(Default, Clone)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers (`echo`, `sum`, ...).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register(&mut registry);
        registry
    }

    /// Register `handler` for `type_tag`, replacing any previous one.
    pub fn register(
        &mut self,
        type_tag: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(type_tag.into(), Arc::new(handler));
        self
    }

    pub fn get(
        &self,
        type_tag: &str,
    ) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(type_tag)
    }

    pub fn contains(
        &self,
        type_tag: &str,
    ) -> bool {
        self.handlers.contains_key(type_tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }
}

/// A handler's view of its job.
pub struct JobScope<'a> {
    job_id: u64,
    request: &'a JobRequest,
    arena: Option<&'a SharedArena>,
    deadline: Option<Instant>,
    response: Option<JobResponse>,
}

impl<'a> JobScope<'a> {
    pub fn new(
        job_id: u64,
        request: &'a JobRequest,
        arena: Option<&'a SharedArena>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            job_id,
            request,
            arena,
            deadline,
            response: None,
        }
    }

    #[inline]
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    #[inline]
    pub fn request(&self) -> &JobRequest {
        self.request
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.request.payload
    }

    /// Decode the MessagePack payload.
    #[track_caller]
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ErrorInfo> {
        let origin = Origin::caller();
        codec::decode(&self.request.payload).map_err(|e| ErrorInfo {
            kind: "decode".to_string(),
            message: e.to_string(),
            origin,
        })
    }

    #[inline]
    pub fn context(&self) -> Option<ContextRef> {
        self.request.context
    }

    /// Read the job's shared context. The context stays pinned while `f` runs.
    #[track_caller]
    pub fn with_context<R>(
        &self,
        f: impl FnOnce(ContextView<'_>) -> Result<R, ErrorInfo>,
    ) -> Result<R, ErrorInfo> {
        let origin = Origin::caller();
        let fail = |kind: &str, message: String| ErrorInfo {
            kind: kind.to_string(),
            message,
            origin: origin.clone(),
        };
        let ctx = self
            .request
            .context
            .ok_or_else(|| fail("no_context", "job has no shared context".to_string()))?;
        let arena = self
            .arena
            .ok_or_else(|| fail("no_context", "worker has no arena".to_string()))?;
        let context_error = |e: MemoryError| {
            let kind = if e.is_fatal() { "corrupted_context" } else { "context" };
            fail(kind, e.to_string())
        };
        let guard = ctx.read(arena).map_err(context_error)?;
        let view = guard.view().map_err(context_error)?;
        f(view)
    }

    /// Store the job's response. Only the first call succeeds.
    pub fn store_response(
        &mut self,
        response: JobResponse,
    ) -> Result<(), WorkerError> {
        if self.response.is_some() {
            return Err(WorkerError::ResponseAlreadyStored);
        }
        self.response = Some(response);
        Ok(())
    }

    /// Store a success with a MessagePack-encoded value.
    pub fn store_success<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), WorkerError> {
        let response = JobResponse::success(value)?;
        self.store_response(response)
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the dispatcher gives up on this job.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    fn into_response(self) -> Option<JobResponse> {
        self.response
    }
}

/// Run one request through the registry. Never fails: every failure mode
/// becomes an `ApplicationError`.
pub fn run_job(
    registry: &JobRegistry,
    arena: Option<&SharedArena>,
    job_id: u64,
    request: &JobRequest,
    deadline: Option<Instant>,
) -> JobResponse {
    let Some(handler) = registry.get(&request.type_tag) else {
        warn!(job_id, tag = %request.type_tag, "unknown job type");
        return JobResponse::error(
            "unknown_job",
            format!("no handler for job type `{}`", request.type_tag),
        );
    };

    let mut scope = JobScope::new(job_id, request, arena, deadline);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&mut scope)));
    match outcome {
        Ok(Ok(())) => scope.into_response().unwrap_or_else(|| {
            JobResponse::error("no_response", "handler finished without storing a response")
        }),
        Ok(Err(info)) => {
            debug!(job_id, error = %info, "job failed");
            JobResponse::error(info.kind, info.message)
        }
        Err(payload) => {
            let info = ErrorInfo::from_panic(payload);
            warn!(job_id, message = %info.message, "job handler panicked");
            JobResponse::error(info.kind, info.message)
        }
    }
}

/// Serve requests until `Shutdown` or end of input. Returns the number of
/// jobs handled.
pub fn serve<R: Read, W: Write>(
    registry: &JobRegistry,
    mut reader: R,
    mut writer: W,
    arena: Option<&SharedArena>,
    worker_id: usize,
) -> Result<u64, WorkerError> {
    write_frame(
        &mut writer,
        &Frame::Hello {
            worker_id,
            pid: std::process::id(),
        },
    )?;
    info!(worker = worker_id, tags = ?registry.tags(), "worker ready");

    let mut handled = 0;
    loop {
        match read_frame(&mut reader)? {
            None => {
                debug!(worker = worker_id, "input closed");
                break;
            }
            Some(Frame::Shutdown) => {
                debug!(worker = worker_id, "shutdown requested");
                break;
            }
            Some(Frame::Request {
                job_id,
                request,
                timeout_ms,
            }) => {
                let deadline = timeout_ms.and_then(|ms| deadline_after(Duration::from_millis(ms)));
                trace!(worker = worker_id, job_id, tag = %request.type_tag, "job received");
                let response = run_job(registry, arena, job_id, &request, deadline);
                write_frame(&mut writer, &Frame::Response { job_id, response })?;
                handled += 1;
            }
            Some(other) => {
                return Err(WorkerError::Protocol(format!(
                    "unexpected frame from dispatcher: {other:?}"
                )))
            }
        }
    }
    info!(worker = worker_id, handled, "worker exiting");
    Ok(handled)
}
