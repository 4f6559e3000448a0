//! # tasklane 性能基准测试
//!
//! 使用 Criterion.rs 进行性能基准测试。
//!
//! ## 基准测试分组
//! - `scheduler`: fork/wait 与 wait queue
//! - `memory`: 上下文发布与零拷贝读取
//! - `codec`: 帧编解码
//!
//! ## 使用方法
//! ```bash
//! cargo bench            # 运行所有
//! cargo bench scheduler  # 只运行调度器基准
//! ```

use std::hint::black_box;
use std::io::Cursor;

use criterion::{criterion_group, criterion_main, Criterion};
use tasklane::jobs::codec::{read_frame, write_frame, Frame};
use tasklane::jobs::JobRequest;
use tasklane::runtime::memory::ContextManager;
use tasklane::runtime::value::Value;
use tasklane::util::config::ArenaConfig;
use tasklane::{Scheduler, SchedulerConfig};

// ============================================================================
// Scheduler - 调度器
// ============================================================================

fn bench_fork_wait(c: &mut Criterion) {
    c.bench_function("scheduler_fork_wait_100", |b| {
        b.iter(|| {
            Scheduler::new(SchedulerConfig::virtual_time())
                .run(|cx| async move {
                    let forks = (0..100i64)
                        .map(|i| cx.fork(move |_| async move { Ok(i) }))
                        .collect::<Result<Vec<_>, _>>()?;
                    let mut total = 0;
                    for f in &forks {
                        total += cx.wait_concurrently(f).await?;
                    }
                    Ok(total)
                })
                .unwrap()
        })
    });
}

fn bench_yield(c: &mut Criterion) {
    c.bench_function("scheduler_yield_1000", |b| {
        b.iter(|| {
            Scheduler::new(SchedulerConfig::virtual_time())
                .run(|cx| async move {
                    for _ in 0..1000 {
                        cx.yield_now().await;
                    }
                    Ok(black_box(1u8))
                })
                .unwrap()
        })
    });
}

fn bench_wait_queue(c: &mut Criterion) {
    c.bench_function("scheduler_wait_queue_100", |b| {
        b.iter(|| {
            Scheduler::new(SchedulerConfig::virtual_time())
                .run(|cx| async move {
                    let forks = (0..100u64)
                        .map(|i| {
                            cx.fork(move |cx| async move {
                                cx.sleep(std::time::Duration::from_millis(100 - i)).await;
                                Ok(i)
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    let queue = cx.wait_queue(forks)?;
                    let mut n = 0;
                    while queue.next(None).await.is_some() {
                        n += 1;
                    }
                    Ok(n)
                })
                .unwrap()
        })
    });
}

// ============================================================================
// Memory - 共享内存上下文
// ============================================================================

fn sample_context() -> Value {
    Value::map((0..64).map(|i| {
        (
            format!("key{i}"),
            Value::Array((0..16).map(|j| Value::Int(i * 16 + j)).collect()),
        )
    }))
}

fn bench_publish(c: &mut Criterion) {
    let contexts = ContextManager::create(&ArenaConfig {
        slot_count: 4,
        slot_size: 64 * 1024,
        dir: None,
    })
    .unwrap();
    let value = sample_context();
    c.bench_function("memory_publish_discard", |b| {
        b.iter(|| {
            let ctx = contexts.publish(black_box(&value)).unwrap();
            contexts.discard(&ctx).unwrap();
        })
    });
}

fn bench_read(c: &mut Criterion) {
    let contexts = ContextManager::create(&ArenaConfig {
        slot_count: 4,
        slot_size: 64 * 1024,
        dir: None,
    })
    .unwrap();
    let ctx = contexts.publish(&sample_context()).unwrap();
    contexts.attach(&ctx).unwrap();
    c.bench_function("memory_read_lookup", |b| {
        b.iter(|| {
            let guard = contexts.read(&ctx).unwrap();
            let view = guard.view().unwrap();
            let row = view.get(black_box("key42")).unwrap().unwrap();
            row.items().unwrap().len()
        })
    });
}

// ============================================================================
// Codec - 帧编解码
// ============================================================================

fn bench_frame_roundtrip(c: &mut Criterion) {
    let frame = Frame::Request {
        job_id: 1,
        request: JobRequest::encode("sum", &(0..256i64).collect::<Vec<_>>()).unwrap(),
        timeout_ms: Some(1000),
    };
    c.bench_function("codec_frame_roundtrip", |b| {
        b.iter(|| {
            let mut buf = Vec::with_capacity(4096);
            write_frame(&mut buf, black_box(&frame)).unwrap();
            read_frame(&mut Cursor::new(buf)).unwrap()
        })
    });
}

criterion_group!(scheduler, bench_fork_wait, bench_yield, bench_wait_queue);
criterion_group!(memory, bench_publish, bench_read);
criterion_group!(codec, bench_frame_roundtrip);
criterion_main!(scheduler, memory, codec);
