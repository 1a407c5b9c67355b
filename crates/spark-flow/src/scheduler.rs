use std::{
    borrow::Cow,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use tracing::trace;

use crate::Executor;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const AGAIN: u8 = 2;
const STOPPED: u8 = 3;

/// `SequentialScheduler` 保证同一任务在任意时刻至多只有一轮在执行。
///
/// # 教案式说明
/// - **意图 (Why)**：Reader、Writer 以及各自的下游推送循环都需要“单飞”语义：
///   任意线程都可以唤醒它们，但处理过程不能与自身并发，否则共享缓冲会被交错修改。
/// - **逻辑 (How)**：
///   - 状态机为 `IDLE → RUNNING → (AGAIN → RUNNING)* → IDLE`，`STOPPED` 为吸收态；
///   - 唤醒时若处于 `IDLE`，调用者本身获得执行权；若处于 `RUNNING`，改写为 `AGAIN` 后立即返回；
///   - 执行者每跑完一轮尝试 `RUNNING → IDLE`，失败说明期间到达了新的唤醒，于是
///     `AGAIN → RUNNING` 再跑一轮。因此运行期间到达的唤醒**不会丢失**，也不会并发执行。
/// - **契约 (What)**：
///   - 任务内部可以重入调用 [`SequentialScheduler::run_or_schedule`]，效果等同于请求“再来一轮”；
///   - [`SequentialScheduler::stop`] 之后任何唤醒都被忽略；
///   - 任务 panic 时调度器进入 `STOPPED`，避免留下永远为 `RUNNING` 的僵尸状态。
/// - **设计权衡 (Trade-offs)**：多次唤醒会被合并为一轮，任务必须自行检查“是否还有工作”，
///   而不是依赖唤醒次数。
pub struct SequentialScheduler {
    name: Cow<'static, str>,
    state: AtomicU8,
    task: Box<dyn Fn() + Send + Sync>,
}

impl SequentialScheduler {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        task: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: AtomicU8::new(IDLE),
            task: Box::new(task),
        })
    }

    /// 在当前线程执行任务，若已有执行者则登记一次“再来一轮”。
    pub fn run_or_schedule(&self) {
        if self.try_begin() {
            self.drain();
        }
    }

    /// 与 [`Self::run_or_schedule`] 相同，但获得执行权后把循环交给 `executor`。
    pub fn run_or_schedule_on(self: &Arc<Self>, executor: &dyn Executor) {
        if self.try_begin() {
            let this = Arc::clone(self);
            executor.execute(Box::new(move || this.drain()));
        }
    }

    /// 进入吸收态，之后的唤醒全部忽略；正在执行的一轮会在结束后退出循环。
    pub fn stop(&self) {
        let prev = self.state.swap(STOPPED, Ordering::AcqRel);
        if prev != STOPPED {
            trace!(scheduler = %self.name, "sequential scheduler stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), RUNNING | AGAIN)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 尝试获得执行权；返回 `false` 表示已有执行者（已登记 AGAIN）或调度器已停止。
    fn try_begin(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => RUNNING,
                RUNNING => AGAIN,
                _ => return false,
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next == RUNNING,
                Err(actual) => current = actual,
            }
        }
    }

    fn drain(&self) {
        let guard = PanicGuard { state: &self.state };
        loop {
            (self.task)();
            match self
                .state
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(AGAIN) => {
                    if self
                        .state
                        .compare_exchange(AGAIN, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        drop(guard);
    }
}

impl fmt::Debug for SequentialScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialScheduler")
            .field("name", &self.name)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

struct PanicGuard<'a> {
    state: &'a AtomicU8,
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.state.store(STOPPED, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn reentrant_wakeup_runs_one_more_pass() {
        let runs = Arc::new(AtomicUsize::new(0));
        let slot: Arc<parking_lot::Mutex<Option<Arc<SequentialScheduler>>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let scheduler = {
            let runs = Arc::clone(&runs);
            let slot = Arc::clone(&slot);
            SequentialScheduler::new("reentrant", move || {
                let n = runs.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    let scheduler = slot.lock().clone();
                    if let Some(scheduler) = scheduler {
                        scheduler.run_or_schedule();
                    }
                }
            })
        };
        *slot.lock() = Some(Arc::clone(&scheduler));
        scheduler.run_or_schedule();
        assert_eq!(runs.load(Ordering::SeqCst), 2, "重入唤醒应追加且仅追加一轮");
        assert!(!scheduler.is_running());
        slot.lock().take();
    }

    #[test]
    fn stopped_scheduler_ignores_wakeups() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = {
            let runs = Arc::clone(&runs);
            SequentialScheduler::new("stopped", move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };
        scheduler.stop();
        scheduler.run_or_schedule();
        assert!(scheduler.is_stopped());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_task_stops_scheduler() {
        let scheduler = SequentialScheduler::new("panics", || panic!("任务故意失败"));
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scheduler.run_or_schedule();
        }));
        assert!(outcome.is_err());
        assert!(scheduler.is_stopped(), "panic 后不得残留 RUNNING 状态");
    }
}
