//! Shared list tests

use crate::runtime::future::Done;
use crate::runtime::scheduler::{Scheduler, SchedulerConfig};
use crate::runtime::shared::SharedList;

#[test]
fn test_index_access() {
    let list = SharedList::from(vec![1, 2, 3]);
    assert_eq!(list.get(1), Some(2));
    assert_eq!(list.set(1, 20), Some(2));
    assert_eq!(list.remove(0), Some(1));
    assert_eq!(list.remove(9), None);
    assert_eq!(list.snapshot(), vec![20, 3]);
    assert_eq!(list.with(|items| items.iter().sum::<i32>()), 23);
}

#[test]
fn test_index_loop_sees_changes_made_during_suspension() {
    let scheduler = Scheduler::new(SchedulerConfig::virtual_time());
    let seen = scheduler
        .run(|cx| async move {
            let list = SharedList::from(vec![1i64, 2, 3]);
            let writer = list.clone();
            cx.fork(move |_| async move {
                writer.clear();
                writer.push(100);
                Ok(Done)
            })?;

            let mut seen = Vec::new();
            let mut i = 0;
            // Revalidate the index after every suspension point.
            while let Some(item) = list.get(i) {
                seen.push(item);
                cx.yield_now().await;
                i += 1;
            }
            Ok(seen)
        })
        .unwrap();
    assert_eq!(seen, vec![1]);
}
