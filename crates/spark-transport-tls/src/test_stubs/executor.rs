//! 由测试显式驱动的执行器。

use std::collections::VecDeque;

use parking_lot::Mutex;
use spark_flow::{Executor, Task};

/// 只排队不执行，测试调用 [`ManualExecutor::run_all`] 时才运行。
///
/// - **契约 (What)**：`run_all` 会继续运行执行期间新排入的任务，直到队列为空。
#[derive(Default)]
pub struct ManualExecutor {
    queue: Mutex<VecDeque<Task>>,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// 运行全部排队任务，返回运行的数量。
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let Some(task) = self.queue.lock().pop_front() else {
                return ran;
            };
            task();
            ran += 1;
        }
    }
}

impl Executor for ManualExecutor {
    fn execute(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}
