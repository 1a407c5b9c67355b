//! 任务执行设施。
//!
//! # 模块角色（Why）
//! - 握手委托任务与各方向的处理循环需要在“调用者线程之外”运行，具体放在哪里由宿主决定；
//! - 以最小 trait [`Executor`] 隔离运行时选择：测试使用 [`InlineExecutor`] 获得确定性，
//!   无运行时环境使用 [`ThreadExecutor`]，Tokio 宿主使用 `TokioExecutor`。
//!
//! # 契约说明（What）
//! - `execute` 不得丢弃任务：无法派发时必须回退为内联执行；
//! - 任务可能阻塞（证书校验等 CPU 密集工作），因此 Tokio 实现走 `spawn_blocking`。

use std::{borrow::Cow, sync::Arc, thread};

use parking_lot::Mutex;
use tracing::error;

/// 可派发的一次性任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn execute(&self, task: Task) {
        (**self).execute(task)
    }
}

/// 在调用线程上立即执行任务。
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task()
    }
}

/// 每个任务派生一个命名线程。
///
/// - **风险 (Trade-offs)**：线程创建开销较大，仅适合握手任务这类低频工作；
///   线程创建失败时记录 `error` 并在调用线程上执行，保证任务不丢失。
#[derive(Clone, Debug)]
pub struct ThreadExecutor {
    name: Cow<'static, str>,
}

impl ThreadExecutor {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new("spark-flow-task")
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, task: Task) {
        let slot = Arc::new(Mutex::new(Some(task)));
        let remote = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || {
                if let Some(task) = remote.lock().take() {
                    task();
                }
            });
        if let Err(err) = spawned {
            error!(executor = %self.name, error = %err, "failed to spawn worker thread, running inline");
            if let Some(task) = slot.lock().take() {
                task();
            }
        }
    }
}

#[cfg(feature = "runtime-tokio")]
mod tokio_executor {
    use tokio::runtime::Handle;

    use super::{Executor, Task};

    /// 基于 Tokio 阻塞线程池的执行器。
    #[derive(Clone, Debug)]
    pub struct TokioExecutor {
        handle: Handle,
    }

    impl TokioExecutor {
        pub fn new(handle: Handle) -> Self {
            Self { handle }
        }

        /// 捕获当前线程所在的运行时；不在运行时上下文中时返回 `None`。
        pub fn try_current() -> Option<Self> {
            Handle::try_current().ok().map(Self::new)
        }
    }

    impl Executor for TokioExecutor {
        fn execute(&self, task: Task) {
            drop(self.handle.spawn_blocking(task));
        }
    }
}

#[cfg(feature = "runtime-tokio")]
pub use tokio_executor::TokioExecutor;

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn thread_executor_runs_task_off_thread() {
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        ThreadExecutor::new("executor-test").execute(Box::new(move || {
            tx.send(thread::current().id()).expect("发送线程标识");
        }));
        let worker = rx.recv().expect("任务应被执行");
        assert_ne!(worker, caller);
    }

    #[test]
    fn inline_executor_runs_immediately() {
        let flag = Arc::new(Mutex::new(false));
        let inner = Arc::clone(&flag);
        InlineExecutor.execute(Box::new(move || *inner.lock() = true));
        assert!(*flag.lock());
    }

    #[cfg(feature = "runtime-tokio")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tokio_executor_uses_blocking_pool() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let executor = TokioExecutor::try_current().expect("测试运行于 Tokio 运行时");
        executor.execute(Box::new(move || {
            let _ = tx.send(42u8);
        }));
        assert_eq!(rx.await.expect("阻塞任务应完成"), 42);
    }
}
