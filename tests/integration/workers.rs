//! Jobs on real worker processes started from the built binary.

use std::path::PathBuf;
use std::time::Duration;

use tasklane::jobs::{DispatchError, JobDispatcher, JobRequest};
use tasklane::runtime::scheduler::{Scheduler, SchedulerConfig};
use tasklane::runtime::value::Value;
use tasklane::util::config::{ArenaConfig, JobConfig, WorkerMode};
use tasklane::Done;

fn process_workers(workers: usize) -> JobConfig {
    JobConfig {
        workers,
        mode: WorkerMode::Process,
        program: Some(PathBuf::from(env!("CARGO_BIN_EXE_tasklane"))),
        ..JobConfig::default()
    }
}

fn arena() -> ArenaConfig {
    ArenaConfig {
        slot_count: 4,
        slot_size: 8192,
        dir: None,
    }
}

#[test]
fn test_process_workers_run_jobs() {
    let totals = Scheduler::new(SchedulerConfig::default())
        .run(|cx| async move {
            let jobs = JobDispatcher::spawn(&cx, process_workers(2), arena()).unwrap();
            let requests = (1..=8i64).map(|n| JobRequest::encode("sum", &(1..=n).collect::<Vec<_>>()).unwrap());
            let mut totals = Vec::new();
            for handle in jobs.start_multi(requests, Some(Duration::from_secs(10))) {
                let response = cx.wait_concurrently(handle?.future()).await?;
                totals.push(response.decode::<i64>()?);
            }
            Ok(totals)
        })
        .unwrap();
    assert_eq!(totals, vec![1, 3, 6, 10, 15, 21, 28, 36]);
}

#[test]
fn test_process_workers_read_shared_context() {
    let (sum, name) = Scheduler::new(SchedulerConfig::default())
        .run(|cx| async move {
            let jobs = JobDispatcher::spawn(&cx, process_workers(2), arena()).unwrap();
            let json: serde_json::Value =
                serde_json::from_str(r#"{"name": "grid", "rows": [[1, 2], [3, 4]], "scale": 10}"#)
                    .unwrap();
            let ctx = jobs.contexts().publish(&Value::from(json)).unwrap();

            let sum = jobs.start(JobRequest::new("context_sum", vec![]).with_context(ctx), None)?;
            let name = jobs.start(JobRequest::encode("context_get", "name").unwrap().with_context(ctx), None)?;
            let sum = cx.wait_concurrently(sum.future()).await?.decode::<i64>()?;
            let name = cx.wait_concurrently(name.future()).await?.decode::<Value>()?;
            assert!(jobs.contexts().refcount(&ctx).is_err());
            Ok((sum, name))
        })
        .unwrap();
    assert_eq!(sum, 20);
    assert_eq!(name, Value::from("grid"));
}

#[test]
fn test_process_worker_timeout() {
    let config = JobConfig {
        shutdown_timeout_ms: 200,
        ..process_workers(1)
    };
    let kind = Scheduler::new(SchedulerConfig::default())
        .run(|cx| async move {
            let jobs = JobDispatcher::spawn(&cx, config, arena()).unwrap();
            let slow = jobs.start(
                JobRequest::encode("sleep", &5_000u64).unwrap(),
                Some(Duration::from_millis(100)),
            )?;
            let response = cx.wait_concurrently(slow.future()).await?;
            Ok(response.error_kind().map(str::to_string))
        })
        .unwrap();
    assert_eq!(kind.as_deref(), Some("timeout"));
}

#[cfg(unix)]
#[test]
fn test_dead_workers() {
    // `true` ignores its arguments and exits at once.
    let config = JobConfig {
        program: Some(PathBuf::from("true")),
        ..process_workers(2)
    };
    Scheduler::new(SchedulerConfig::default())
        .run(|cx| async move {
            let jobs = JobDispatcher::spawn(&cx, config, arena()).unwrap();
            let handle = jobs.start(JobRequest::new("echo", vec![1]), None)?;
            let response = cx.wait_concurrently(handle.future()).await?;
            assert_eq!(response.error_kind(), Some("worker_lost"));

            while jobs.workers_count() > 0 {
                cx.sleep(Duration::from_millis(5)).await;
            }
            let rejected = jobs.start(JobRequest::new("echo", vec![1]), None);
            assert!(matches!(rejected, Err(DispatchError::NoWorkers)));
            Ok(Done)
        })
        .unwrap();
}
