//! Scheduler behaviour through the public API.

use std::time::Duration;

use tasklane::runtime::shared::SharedList;
use tasklane::{Done, ErrorInfo, Scheduler, SchedulerConfig, SchedulerError, TaskError};

#[test]
fn test_wait_queue_completion_order() {
    let order = Scheduler::new(SchedulerConfig::virtual_time())
        .run(|cx| async move {
            let forks = [30u64, 10, 20]
                .into_iter()
                .map(|ms| {
                    cx.fork(move |cx| async move {
                        cx.sleep(Duration::from_millis(ms)).await;
                        Ok(ms)
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let queue = cx.wait_queue(forks)?;
            let mut order = Vec::new();
            while let Some(f) = queue.next(None).await {
                order.push(cx.wait_concurrently(&f).await?);
            }
            Ok(order)
        })
        .unwrap();
    assert_eq!(order, vec![10, 20, 30]);
}

#[test]
fn test_producers_and_consumer_share_a_list() {
    let collected = Scheduler::new(SchedulerConfig::virtual_time())
        .run(|cx| async move {
            let list = SharedList::new();
            for id in 0..3i64 {
                let list = list.clone();
                cx.fork(move |cx| async move {
                    for step in 0..2 {
                        list.push(id * 10 + step);
                        cx.yield_now().await;
                    }
                    Ok(Done)
                })?;
            }
            cx.set_wait_all_forks_on_finish(true);
            while list.len() < 6 {
                cx.yield_now().await;
            }
            let mut items = list.snapshot();
            items.sort_unstable();
            Ok(items)
        })
        .unwrap();
    assert_eq!(collected, vec![0, 1, 10, 11, 20, 21]);
}

#[test]
fn test_error_crosses_tasks() {
    let err = Scheduler::new(SchedulerConfig::virtual_time())
        .run(|cx| async move {
            let failing = cx.fork(|_| async { Err::<i64, _>(ErrorInfo::new("parse", "bad digit")) })?;
            match cx.wait(&failing, None).await {
                Err(TaskError::Raised(info)) => Err::<Done, _>(info),
                other => panic!("expected a raised error, got {other:?}"),
            }
        })
        .unwrap_err();
    match err {
        SchedulerError::Root(info) => {
            assert_eq!(info.kind, "parse");
            assert_eq!(info.message, "bad digit");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_real_clock_sleep() {
    let elapsed = Scheduler::new(SchedulerConfig::default())
        .run(|cx| async move {
            let start = cx.now();
            cx.sleep(Duration::from_millis(15)).await;
            Ok(cx.now() - start)
        })
        .unwrap();
    assert!(elapsed >= Duration::from_millis(15));
}
