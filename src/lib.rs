//! tasklane: cooperative fork/wait tasks with out-of-process job workers
//!
//! Computations run as tasks on a single-threaded cooperative scheduler and
//! hand results to each other through futures. CPU-bound work can be sent to
//! worker processes as jobs; large read-only inputs are published once into
//! shared memory and passed to jobs by reference.
//!
//! ```
//! use tasklane::runtime::scheduler::{Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(SchedulerConfig::virtual_time());
//! let squares = scheduler
//!     .run(|cx| async move {
//!         let forks: Vec<_> = (1..=3i64)
//!             .map(|i| cx.fork(move |_| async move { Ok(i * i) }))
//!             .collect::<Result<_, _>>()?;
//!         let mut out = Vec::new();
//!         for f in &forks {
//!             out.push(cx.wait_concurrently(f).await?);
//!         }
//!         Ok(out)
//!     })
//!     .unwrap();
//! assert_eq!(squares, vec![1, 4, 9]);
//! ```

#![warn(rust_2018_idioms)]
#![deny(clippy::await_holding_refcell_ref, clippy::await_holding_lock)]

pub mod jobs;
pub mod runtime;
pub mod util;

pub use jobs::{DispatchError, JobDispatcher, JobHandle, JobRequest, JobResponse};
pub use runtime::future::{Done, ErrorInfo, FutureHandle, TaskError, WaitQueue};
pub use runtime::scheduler::{Cx, Scheduler, SchedulerConfig, SchedulerError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
