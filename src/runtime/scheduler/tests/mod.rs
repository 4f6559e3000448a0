//! Scheduler 单元测试
//!
//! 测试 fork / wait / yield、退出策略、时钟和死锁检测

mod lifecycle;

use std::time::Duration;

use crate::runtime::future::{ErrorInfo, FutureHandle};
use crate::runtime::scheduler::{Cx, Scheduler, SchedulerConfig, SchedulerError};

pub(super) fn virtual_scheduler() -> Scheduler {
    Scheduler::new(SchedulerConfig::virtual_time())
}

/// Fork a task that sleeps `ms` of scheduler time and returns it.
pub(super) fn sleeper(
    cx: &Cx,
    ms: u64,
) -> Result<FutureHandle<u64>, SchedulerError> {
    cx.fork(move |cx| async move {
        cx.sleep(Duration::from_millis(ms)).await;
        Ok(ms)
    })
}

#[test]
fn test_task_id_display() {
    use crate::runtime::scheduler::TaskId;
    assert_eq!(TaskId(5).to_string(), "Task(5)");
    assert_eq!(TaskId::from(7).inner(), 7);
}

#[test]
fn test_run_returns_root_value() {
    let value = virtual_scheduler().run(|_| async { Ok(5i64) }).unwrap();
    assert_eq!(value, 5);
}

#[test]
fn test_root_may_return_unit() {
    assert!(virtual_scheduler().run(|_| async { Ok(()) }).is_ok());
}

#[test]
fn test_root_error_surfaces() {
    let err = virtual_scheduler()
        .run(|_| async { Err::<i64, _>(ErrorInfo::new("root", "failed")) })
        .unwrap_err();
    match err {
        SchedulerError::Root(info) => {
            assert_eq!(info.kind, "root");
            assert_eq!(info.message, "failed");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_root_panic_is_captured() {
    let err = virtual_scheduler()
        .run(|_| async {
            if true {
                panic!("root exploded");
            }
            Ok(1i64)
        })
        .unwrap_err();
    match err {
        SchedulerError::Root(info) => {
            assert_eq!(info.kind, "panic");
            assert_eq!(info.message, "root exploded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_nested_run_is_rejected() {
    let scheduler = std::rc::Rc::new(virtual_scheduler());
    let inner = scheduler.clone();
    let nested = scheduler
        .run(move |_| async move { Ok(inner.run(|_| async { Ok(1i64) })) })
        .unwrap();
    assert_eq!(nested, Err(SchedulerError::AlreadyRunning));
}

#[test]
fn test_scheduler_is_reusable() {
    let scheduler = virtual_scheduler();
    assert_eq!(scheduler.run(|_| async { Ok(1i64) }).unwrap(), 1);
    assert_eq!(scheduler.run(|_| async { Ok(2i64) }).unwrap(), 2);
    assert_eq!(scheduler.stats().forked, 2);
}
