//! Exit policy, deadlock detection, task bookkeeping and event sources

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use super::{sleeper, virtual_scheduler};
use crate::runtime::future::{Done, ErrorInfo, FutureHandle, Resolver};
use crate::runtime::scheduler::{
    EventSource, Scheduler, SchedulerConfig, SchedulerError, TaskState,
};

#[test]
fn test_abandon_policy_drops_unfinished_forks() {
    let finished = Rc::new(Cell::new(false));
    let flag = finished.clone();
    let scheduler = virtual_scheduler();
    scheduler
        .run(move |cx| async move {
            cx.fork(move |cx| async move {
                cx.sleep(Duration::from_millis(50)).await;
                flag.set(true);
                Ok(Done)
            })?;
            Ok(Done)
        })
        .unwrap();
    assert!(!finished.get());
    assert_eq!(scheduler.stats().abandoned, 1);
}

#[test]
fn test_drain_policy_runs_forks_to_completion() {
    let finished = Rc::new(Cell::new(false));
    let flag = finished.clone();
    let scheduler = virtual_scheduler();
    scheduler
        .run(move |cx| async move {
            cx.set_wait_all_forks_on_finish(true);
            assert!(cx.wait_all_forks_on_finish());
            cx.fork(move |cx| async move {
                cx.sleep(Duration::from_millis(50)).await;
                flag.set(true);
                Ok(Done)
            })?;
            Ok(Done)
        })
        .unwrap();
    assert!(finished.get());
    assert_eq!(scheduler.stats().abandoned, 0);
}

#[test]
fn test_drain_policy_from_config() {
    let config = SchedulerConfig {
        wait_all_forks_on_finish: true,
        ..SchedulerConfig::virtual_time()
    };
    let count = Rc::new(Cell::new(0));
    let counter = count.clone();
    Scheduler::new(config)
        .run(move |cx| async move {
            for ms in [5u64, 1, 3] {
                let counter = counter.clone();
                cx.fork(move |cx| async move {
                    cx.sleep(Duration::from_millis(ms)).await;
                    counter.set(counter.get() + 1);
                    Ok(Done)
                })?;
            }
            Ok(Done)
        })
        .unwrap();
    assert_eq!(count.get(), 3);
}

#[test]
fn test_unawaited_error_is_discarded() {
    for drain in [false, true] {
        let scheduler = virtual_scheduler();
        let value = scheduler
            .run(move |cx| async move {
                cx.set_wait_all_forks_on_finish(drain);
                cx.fork(|cx| async move {
                    cx.yield_now().await;
                    Err::<i64, _>(ErrorInfo::new("ignored", "nobody waits for this"))
                })?;
                Ok(7i64)
            })
            .unwrap();
        assert_eq!(value, 7);
    }
}

#[test]
fn test_deadlock_is_detected() {
    let err = virtual_scheduler()
        .run(|cx| async move {
            // Keep the resolver alive so the future can never resolve.
            let (resolver, never): (Resolver<i64>, FutureHandle<i64>) = FutureHandle::channel();
            let value = cx.wait_concurrently(&never).await?;
            drop(resolver);
            Ok(value)
        })
        .unwrap_err();
    assert_eq!(err, SchedulerError::Deadlock { suspended: 1 });
}

#[test]
fn test_drain_with_stuck_fork_abandons_it() {
    let scheduler = virtual_scheduler();
    let value = scheduler
        .run(|cx| async move {
            cx.set_wait_all_forks_on_finish(true);
            cx.fork(|cx| async move {
                let (resolver, never) = FutureHandle::<i64>::channel();
                let v = cx.wait_concurrently(&never).await?;
                drop(resolver);
                Ok(v)
            })?;
            Ok(1i64)
        })
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(scheduler.stats().abandoned, 1);
}

#[test]
fn test_task_states() {
    virtual_scheduler()
        .run(|cx| async move {
            let root = cx.current_task().unwrap();
            assert_eq!(cx.task_state(root), Some(TaskState::Running));

            let child = cx.fork(|cx| async move { Ok(cx.current_task()) })?;
            assert_eq!(cx.task_count(), 2);
            let child_id = cx.wait_concurrently(&child).await?.unwrap();
            assert_ne!(child_id, root);
            assert_eq!(
                cx.task_state(child_id),
                Some(TaskState::Completed { failed: false })
            );
            assert_eq!(cx.task_count(), 1);

            let pending = sleeper(&cx, 5)?;
            cx.yield_now().await;
            let sleeping = crate::runtime::scheduler::TaskId(child_id.inner() + 1);
            assert_eq!(cx.task_state(sleeping), Some(TaskState::Suspended));
            cx.wait_concurrently(&pending).await?;

            let failing = cx.fork(|_| async { Err::<i64, _>(ErrorInfo::new("boom", "boom")) })?;
            let failing_id = crate::runtime::scheduler::TaskId(sleeping.inner() + 1);
            assert_eq!(cx.task_state(failing_id), Some(TaskState::Pending));
            assert!(cx.wait_concurrently(&failing).await.is_err());
            assert_eq!(
                cx.task_state(failing_id),
                Some(TaskState::Completed { failed: true })
            );
            assert_eq!(cx.task_state(crate::runtime::scheduler::TaskId(999)), None);
            Ok(Done)
        })
        .unwrap();
}

#[test]
fn test_stats_count_tasks() {
    let scheduler = virtual_scheduler();
    scheduler
        .run(|cx| async move {
            let ok = cx.fork(|_| async { Ok(1i64) })?;
            let bad = cx.fork(|_| async { Err::<i64, _>(ErrorInfo::new("e", "e")) })?;
            cx.yield_now().await;
            let _ = cx.wait(&ok, None).await;
            let _ = cx.wait(&bad, None).await;
            Ok(Done)
        })
        .unwrap();
    let stats = scheduler.stats();
    assert_eq!(stats.forked, 3);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.yields, 1);
    assert!(stats.polls >= 4);
}

/// Resolves its futures when the scheduler clock reaches their due time, as
/// if the result arrived from outside.
struct Replies {
    pending: RefCell<Vec<(Duration, Resolver<i64>, i64)>>,
    pumps: Cell<usize>,
}

impl EventSource for Replies {
    fn pump(
        &self,
        now: Duration,
    ) -> bool {
        self.pumps.set(self.pumps.get() + 1);
        let mut pending = self.pending.borrow_mut();
        let (due, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|(at, _, _)| *at <= now);
        *pending = rest;
        let progressed = !due.is_empty();
        for (_, resolver, value) in due {
            resolver.resolve(Ok(value));
        }
        progressed
    }

    fn in_flight(&self) -> usize {
        self.pending.borrow().len()
    }

    fn next_deadline(&self) -> Option<Duration> {
        None
    }
}

#[test]
fn test_event_source_resolves_futures() {
    let scheduler = Scheduler::new(SchedulerConfig::default());
    let value = scheduler
        .run(|cx| async move {
            let (resolver, future) = FutureHandle::channel();
            let source = Rc::new(Replies {
                pending: RefCell::new(vec![(cx.now() + Duration::from_millis(20), resolver, 41)]),
                pumps: Cell::new(0),
            });
            let weak: std::rc::Weak<dyn EventSource> = Rc::downgrade(&source) as _;
            cx.register_source(weak);
            let value = cx.wait_concurrently(&future).await?;
            assert!(source.pumps.get() > 0);
            Ok(value + 1)
        })
        .unwrap();
    assert_eq!(value, 42);
}

#[test]
fn test_notifier_is_send() {
    fn assert_send<T: Send + Sync>(_: &T) {}
    virtual_scheduler()
        .run(|cx| async move {
            let notifier = cx.notifier();
            assert_send(&notifier);
            let remote = notifier.clone();
            std::thread::spawn(move || remote.notify()).join().unwrap();
            Ok(Done)
        })
        .unwrap();
}
