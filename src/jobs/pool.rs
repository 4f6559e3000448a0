//! Worker pool: starts workers and moves frames to and from them
//!
//! Each worker gets one reader thread that turns incoming frames into
//! `WorkerEvent`s and wakes the scheduler through its `Notifier`. Writes
//! happen on the scheduler thread.

use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info, trace, warn};

use super::codec::{read_frame, write_body, write_frame, CodecError, Frame};
use super::deadline_after;
use super::request::JobResponse;
use super::worker::JobRegistry;
use super::JobError;
use crate::runtime::scheduler::Notifier;
use crate::util::config::{JobConfig, WorkerMode};

/// Something a worker link reported.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Ready {
        worker: usize,
        pid: u32,
    },
    Response {
        worker: usize,
        job_id: u64,
        response: JobResponse,
    },
    Lost {
        worker: usize,
        reason: String,
    },
}

enum Host {
    Process(Child),
    Thread(Option<JoinHandle<()>>),
}

struct WorkerLink {
    id: usize,
    writer: Option<Box<dyn Write + Send>>,
    host: Host,
    reader: Option<JoinHandle<()>>,
    alive: bool,
    busy: Option<u64>,
}

pub(crate) struct WorkerPool {
    workers: Vec<WorkerLink>,
    events: Receiver<WorkerEvent>,
    shutdown_timeout: Duration,
    shut_down: bool,
}

impl WorkerPool {
    pub fn spawn(
        config: &JobConfig,
        arena_path: &Path,
        registry: Arc<JobRegistry>,
        notifier: Notifier,
    ) -> Result<Self, JobError> {
        let (tx, rx) = channel::unbounded();
        let mut pool = Self {
            workers: Vec::with_capacity(config.workers),
            events: rx,
            shutdown_timeout: config.shutdown_timeout(),
            shut_down: false,
        };
        for id in 0..config.workers {
            // On error the pool is dropped, which stops the workers started so far.
            let link = match config.mode {
                WorkerMode::Process => spawn_process(id, config, arena_path, &tx, &notifier)?,
                WorkerMode::Thread => spawn_thread(id, arena_path, &registry, &tx, &notifier)?,
            };
            pool.workers.push(link);
        }
        info!(workers = config.workers, mode = ?config.mode, "worker pool started");
        Ok(pool)
    }

    pub fn try_event(&self) -> Option<WorkerEvent> {
        self.events.try_recv().ok()
    }

    /// A live worker without a job.
    pub fn idle_worker(&self) -> Option<usize> {
        self.workers
            .iter()
            .find(|w| w.alive && w.busy.is_none())
            .map(|w| w.id)
    }

    pub fn alive_count(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    /// Send an encoded `Request` frame and mark the worker busy with `job_id`.
    pub fn send_job(
        &mut self,
        worker: usize,
        job_id: u64,
        body: &[u8],
    ) -> Result<(), CodecError> {
        let link = self
            .workers
            .get_mut(worker)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such worker"))?;
        let writer = link
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker link closed"))?;
        write_body(writer.as_mut(), body)?;
        link.busy = Some(job_id);
        trace!(worker, job_id, "job sent");
        Ok(())
    }

    /// The worker finished its job. Returns the job it had.
    pub fn release(
        &mut self,
        worker: usize,
    ) -> Option<u64> {
        self.workers.get_mut(worker).and_then(|w| w.busy.take())
    }

    /// The worker is gone. Returns the job it had.
    pub fn mark_lost(
        &mut self,
        worker: usize,
    ) -> Option<u64> {
        let link = self.workers.get_mut(worker)?;
        link.alive = false;
        link.writer = None;
        link.busy.take()
    }

    /// Ask every worker to exit and wait for them, up to the shutdown timeout.
    pub fn shutdown(&mut self) {
        if std::mem::replace(&mut self.shut_down, true) {
            return;
        }
        for link in &mut self.workers {
            if let Some(mut writer) = link.writer.take() {
                if let Err(e) = write_frame(writer.as_mut(), &Frame::Shutdown) {
                    debug!(worker = link.id, error = %e, "shutdown frame not delivered");
                }
            }
        }

        // Unbounded when the timeout is past the clock's range.
        let deadline = deadline_after(self.shutdown_timeout);
        for link in &mut self.workers {
            match &mut link.host {
                Host::Process(child) => wait_child(link.id, child, deadline),
                Host::Thread(handle) => {
                    if let Some(handle) = handle.take() {
                        join_until(link.id, handle, deadline);
                    }
                }
            }
            if let Some(reader) = link.reader.take() {
                join_until(link.id, reader, deadline);
            }
            link.alive = false;
        }
        debug!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn before(deadline: Option<Instant>) -> bool {
    deadline.map_or(true, |d| Instant::now() < d)
}

fn wait_child(
    id: usize,
    child: &mut Child,
    deadline: Option<Instant>,
) {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(worker = id, %status, "worker process exited");
                return;
            }
            Ok(None) if before(deadline) => thread::sleep(Duration::from_millis(5)),
            Ok(None) => {
                warn!(worker = id, "worker did not exit in time; killing it");
                let _ = child.kill();
                let _ = child.wait();
                return;
            }
            Err(e) => {
                warn!(worker = id, error = %e, "failed to wait for worker process");
                return;
            }
        }
    }
}

/// Join `handle` if it finishes before `deadline`; detach it otherwise.
fn join_until(
    id: usize,
    handle: JoinHandle<()>,
    deadline: Option<Instant>,
) {
    while !handle.is_finished() && before(deadline) {
        thread::sleep(Duration::from_millis(2));
    }
    if handle.is_finished() {
        if handle.join().is_err() {
            warn!(worker = id, "worker thread panicked");
        }
    } else {
        warn!(worker = id, "worker thread still busy at shutdown; detaching it");
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    id: usize,
    mut reader: R,
    events: Sender<WorkerEvent>,
    notifier: Notifier,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("tasklane-reader-{id}"))
        .spawn(move || loop {
            let (event, last) = match read_frame(&mut reader) {
                Ok(Some(Frame::Hello { pid, .. })) => (WorkerEvent::Ready { worker: id, pid }, false),
                Ok(Some(Frame::Response { job_id, response })) => (
                    WorkerEvent::Response {
                        worker: id,
                        job_id,
                        response,
                    },
                    false,
                ),
                Ok(Some(other)) => {
                    warn!(worker = id, frame = ?other, "unexpected frame from worker");
                    continue;
                }
                Ok(None) => (
                    WorkerEvent::Lost {
                        worker: id,
                        reason: "worker closed its output".to_string(),
                    },
                    true,
                ),
                Err(e) => (
                    WorkerEvent::Lost {
                        worker: id,
                        reason: e.to_string(),
                    },
                    true,
                ),
            };
            if events.send(event).is_err() {
                // The dispatcher is gone.
                return;
            }
            notifier.notify();
            if last {
                return;
            }
        })
}

fn spawn_process(
    id: usize,
    config: &JobConfig,
    arena_path: &Path,
    events: &Sender<WorkerEvent>,
    notifier: &Notifier,
) -> Result<WorkerLink, JobError> {
    let program = match &config.program {
        Some(program) => program.clone(),
        None => std::env::current_exe()?,
    };
    let mut child = Command::new(&program)
        .arg("worker")
        .arg("--arena")
        .arg(arena_path)
        .arg("--id")
        .arg(id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill();
        return Err(JobError::Worker(format!("worker {id}: stdio not captured")));
    };
    let reader = spawn_reader(id, BufReader::new(stdout), events.clone(), notifier.clone())?;
    debug!(worker = id, pid = child.id(), program = %program.display(), "worker process started");
    Ok(WorkerLink {
        id,
        writer: Some(Box::new(stdin)),
        host: Host::Process(child),
        reader: Some(reader),
        alive: true,
        busy: None,
    })
}

#[cfg(unix)]
fn spawn_thread(
    id: usize,
    arena_path: &Path,
    registry: &Arc<JobRegistry>,
    events: &Sender<WorkerEvent>,
    notifier: &Notifier,
) -> Result<WorkerLink, JobError> {
    use std::os::unix::net::UnixStream;

    use super::worker::serve;
    use crate::runtime::memory::SharedArena;

    let (ours, theirs) = UnixStream::pair()?;
    let input = theirs.try_clone()?;
    let path = arena_path.to_path_buf();
    let registry = registry.clone();
    let host = thread::Builder::new()
        .name(format!("tasklane-worker-{id}"))
        .spawn(move || {
            // Map the arena separately, the way a worker process would.
            let arena = match SharedArena::open(&path) {
                Ok(arena) => Some(arena),
                Err(e) => {
                    warn!(worker = id, error = %e, "cannot open arena; contexts unavailable");
                    None
                }
            };
            if let Err(e) = serve(&registry, BufReader::new(input), theirs, arena.as_ref(), id) {
                warn!(worker = id, error = %e, "worker stopped");
            }
        })?;
    let reader = spawn_reader(id, BufReader::new(ours.try_clone()?), events.clone(), notifier.clone())?;
    Ok(WorkerLink {
        id,
        writer: Some(Box::new(ours)),
        host: Host::Thread(Some(host)),
        reader: Some(reader),
        alive: true,
        busy: None,
    })
}

#[cfg(not(unix))]
fn spawn_thread(
    _id: usize,
    _arena_path: &Path,
    _registry: &Arc<JobRegistry>,
    _events: &Sender<WorkerEvent>,
    _notifier: &Notifier,
) -> Result<WorkerLink, JobError> {
    Err(JobError::Unsupported(
        "thread workers need unix domain sockets".to_string(),
    ))
}
