//! `SequentialScheduler` 并发行为测试。
//!
//! # 教案级导览
//!
//! - **Why**：Reader/Writer 的正确性建立在“单飞 + 唤醒不丢失”两条性质之上，
//!   一旦任务与自身并发或最后一次唤醒被吞掉，流水线就会数据错乱或永久停滞。
//! - **How**：多个线程同时唤醒同一调度器，任务内部用原子计数检测并发进入；
//!   另设“生产计数/消费计数”模型验证所有生产都最终被某一轮消费。
//! - **What**：断言任务从未并发执行，且所有线程退出后消费计数追平生产计数。

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

use spark_flow::{SequentialScheduler, ThreadExecutor};

#[test]
fn concurrent_wakeups_never_overlap_and_never_drop() {
    let produced = Arc::new(AtomicUsize::new(0));
    let consumed = Arc::new(AtomicUsize::new(0));
    let inside = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));

    let scheduler = {
        let produced = Arc::clone(&produced);
        let consumed = Arc::clone(&consumed);
        let inside = Arc::clone(&inside);
        let overlapped = Arc::clone(&overlapped);
        SequentialScheduler::new("overlap-check", move || {
            if inside.swap(true, Ordering::SeqCst) {
                overlapped.store(true, Ordering::SeqCst);
            }
            let target = produced.load(Ordering::SeqCst);
            consumed.store(target, Ordering::SeqCst);
            thread::yield_now();
            inside.store(false, Ordering::SeqCst);
        })
    };

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = Arc::clone(&scheduler);
            let produced = Arc::clone(&produced);
            thread::spawn(move || {
                for _ in 0..500 {
                    produced.fetch_add(1, Ordering::SeqCst);
                    scheduler.run_or_schedule();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("唤醒线程不应 panic");
    }

    assert!(!overlapped.load(Ordering::SeqCst), "任务不得与自身并发执行");
    assert_eq!(
        consumed.load(Ordering::SeqCst),
        produced.load(Ordering::SeqCst),
        "最后一次唤醒必须触发一轮消费"
    );
    assert!(!scheduler.is_running());
}

#[test]
fn executor_backed_scheduler_runs_off_thread() {
    let (tx, rx) = std::sync::mpsc::channel();
    let tx = parking_lot::Mutex::new(tx);
    let scheduler = SequentialScheduler::new("executor-backed", move || {
        let _ = tx.lock().send(thread::current().name().map(str::to_owned));
    });
    scheduler.run_or_schedule_on(&ThreadExecutor::new("scheduler-worker"));
    let name = rx.recv().expect("任务应被执行");
    assert_eq!(name.as_deref(), Some("scheduler-worker"));
}
