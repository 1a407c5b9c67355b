//! 单方向的中继阶段。
//!
//! # 模块角色（Why）
//! - Reader 与 Writer 都是“订阅上游、加工、按下游需求推送”的处理器，
//!   上游窗口、下游输出队列、推送调度与错误锁存完全同构，集中在 [`Stage`] 中实现；
//! - 方向差异（窗口策略、加工逻辑）留给 `reader`/`writer` 模块。
//!
//! # 推送循环（How）
//! 1. Reader 方向先执行读调度钩子（Tube 在此挂接待定订阅者，保证 `on_subscribe` 不与 `on_next` 交错）；
//! 2. 在下游需求范围内按顺序投递输出队列；
//! 3. 若锁存了错误，投递一次 `on_error` 并停止推送；
//! 4. 否则刷新上游窗口，并在输出排空且已请求结束时投递一次 `on_complete`。
//!
//! 终止信号投递后释放下游引用，断开与外部订阅者之间的引用环。

use std::{
    collections::VecDeque,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use spark_flow::{
    ByteChunks, Completion, Demand, FlowError, SequentialScheduler, Subscriber, Subscription,
};
use tracing::{debug, trace, warn};

use super::{Shared, Side};

pub(crate) struct Stage {
    side: Side,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    pub(crate) upstream_window: Demand,
    pub(crate) upstream_completed: AtomicBool,
    downstream: Mutex<Option<Arc<dyn Subscriber<ByteChunks>>>>,
    subscription: Arc<StageSubscription>,
    pub(crate) demand: Demand,
    cancelled: AtomicBool,
    output: Mutex<VecDeque<ByteChunks>>,
    downstream_completed: AtomicBool,
    terminal_sent: AtomicBool,
    error: OnceLock<FlowError>,
    pub(crate) push: Arc<SequentialScheduler>,
    pub(crate) completion: Completion<()>,
}

impl Stage {
    pub(crate) fn new(side: Side, name: &str, weak: Weak<Shared>) -> Self {
        let push = {
            let weak = weak.clone();
            SequentialScheduler::new(format!("{name}-{}-push", side.label()), move || {
                if let Some(shared) = weak.upgrade() {
                    shared.push_pass(side);
                }
            })
        };
        Self {
            side,
            upstream: Mutex::new(None),
            upstream_window: Demand::new(),
            upstream_completed: AtomicBool::new(false),
            downstream: Mutex::new(None),
            subscription: Arc::new(StageSubscription { weak, side }),
            demand: Demand::new(),
            cancelled: AtomicBool::new(false),
            output: Mutex::new(VecDeque::new()),
            downstream_completed: AtomicBool::new(false),
            terminal_sent: AtomicBool::new(false),
            error: OnceLock::new(),
            push,
            completion: Completion::new(),
        }
    }

    /// 把加工结果放入输出队列；`complete` 为 `true` 时请求在队列排空后结束下游。
    pub(crate) fn outgoing(&self, items: ByteChunks, complete: bool) {
        if spark_flow::remaining(&items) > 0 {
            self.output.lock().push_back(items);
        }
        if complete {
            self.downstream_completed.store(true, Ordering::Release);
        }
        self.push.run_or_schedule();
    }

    /// 锁存错误并安排推送；只有第一个错误会被投递。
    pub(crate) fn fail(&self, error: FlowError) {
        let _ = self.error.set(error.clone());
        self.completion.fail(error);
        self.push.run_or_schedule();
    }

    pub(crate) fn output_len(&self) -> usize {
        self.output.lock().len()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminal_sent.load(Ordering::Acquire)
    }

    pub(crate) fn upstream_subscription(&self) -> Option<Arc<dyn Subscription>> {
        self.upstream.lock().clone()
    }

    /// 记录上游订阅；重复订阅被取消。
    pub(crate) fn set_upstream(&self, subscription: Arc<dyn Subscription>) -> bool {
        let mut slot = self.upstream.lock();
        if slot.is_some() {
            drop(slot);
            warn!(side = self.side.label(), "duplicate upstream subscription cancelled");
            subscription.cancel();
            return false;
        }
        *slot = Some(subscription);
        true
    }

    /// 取消并释放上游订阅。
    pub(crate) fn cancel_upstream(&self) {
        let upstream = self.upstream.lock().take();
        if let Some(upstream) = upstream {
            upstream.cancel();
        }
    }

    /// 正常结束后释放上游订阅，不发送取消。
    pub(crate) fn release_upstream(&self) {
        self.upstream.lock().take();
    }

    /// 挂接下游订阅者，旧订阅者收到 `on_detach`。
    pub(crate) fn set_downstream(&self, subscriber: Arc<dyn Subscriber<ByteChunks>>) {
        let previous = self.downstream.lock().replace(Arc::clone(&subscriber));
        if let Some(previous) = previous {
            previous.on_detach();
        }
        subscriber.on_subscribe(self.subscription.clone());
        self.push.run_or_schedule();
    }

    pub(crate) fn reset_demand(&self) {
        self.demand.reset();
    }

    fn release_downstream(&self) {
        self.downstream.lock().take();
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(side = self.side.label(), "downstream cancelled");
        self.push.stop();
        self.output.lock().clear();
        self.cancel_upstream();
        self.release_downstream();
        if !self.is_terminated() {
            self.completion.fail(FlowError::Cancelled);
        }
    }
}

/// 下游持有的订阅句柄。
pub(crate) struct StageSubscription {
    weak: Weak<Shared>,
    side: Side,
}

impl Subscription for StageSubscription {
    fn request(&self, n: u64) {
        let Some(shared) = self.weak.upgrade() else {
            return;
        };
        let stage = shared.stage(self.side);
        match stage.demand.increase(n) {
            Ok(_) => stage.push.run_or_schedule(),
            Err(err) => shared.handle_error(err),
        }
    }

    fn cancel(&self) {
        if let Some(shared) = self.weak.upgrade() {
            shared.stage(self.side).cancel();
        }
    }
}

impl Shared {
    /// 推送调度器的单轮任务。
    pub(super) fn push_pass(&self, side: Side) {
        if side == Side::Reader {
            self.enter_read_scheduling();
        }
        let stage = self.stage(side);
        if stage.cancelled.load(Ordering::Acquire) || stage.is_terminated() {
            return;
        }
        let Some(downstream) = stage.downstream.lock().clone() else {
            return;
        };
        loop {
            let item = {
                let mut output = stage.output.lock();
                if output.is_empty() || !stage.demand.try_decrement() {
                    None
                } else {
                    output.pop_front()
                }
            };
            match item {
                Some(item) => downstream.on_next(item),
                None => break,
            }
        }
        if let Some(error) = stage.error.get() {
            if !stage.terminal_sent.swap(true, Ordering::AcqRel) {
                stage.output.lock().clear();
                stage.push.stop();
                stage.release_downstream();
                debug!(flow = %self.name, side = side.label(), kind = error.kind(), "delivering error downstream");
                downstream.on_error(error.clone());
            }
            return;
        }
        self.upstream_window_update(side);
        if stage.downstream_completed.load(Ordering::Acquire)
            && stage.output.lock().is_empty()
            && !stage.terminal_sent.swap(true, Ordering::AcqRel)
        {
            stage.release_downstream();
            debug!(flow = %self.name, side = side.label(), "delivering completion downstream");
            downstream.on_complete();
            stage.completion.complete(());
        }
    }

    /// 依据方向策略向上游补充窗口。
    pub(super) fn upstream_window_update(&self, side: Side) {
        let stage = self.stage(side);
        if self.is_stopped()
            || stage.upstream_completed.load(Ordering::Acquire)
            || stage.error.get().is_some()
        {
            return;
        }
        let window = stage.upstream_window.get();
        let queued = stage.output_len();
        let n = match side {
            Side::Reader => self.reader_window_update(window, queued),
            Side::Writer => self.writer_window_update(window, queued),
        };
        if n > 0 {
            self.upstream_request(side, n);
        }
    }

    /// 默认窗口策略：窗口耗尽且下游队列较短时请求一个元素。
    pub(super) fn default_window_update(&self, window: u64, queued: usize) -> u64 {
        if window > 0 || queued >= self.config.downstream_queue_limit {
            0
        } else {
            1
        }
    }

    pub(super) fn upstream_request(&self, side: Side, n: u64) {
        let stage = self.stage(side);
        let Some(upstream) = stage.upstream_subscription() else {
            return;
        };
        if stage.upstream_window.increase(n).is_ok() {
            trace!(flow = %self.name, side = side.label(), n, "requesting from upstream");
            upstream.request(n);
        }
    }

    /// 上游 `on_subscribe`。
    pub(super) fn stage_on_subscribe(&self, side: Side, subscription: Arc<dyn Subscription>) {
        if self.is_stopped() {
            subscription.cancel();
            return;
        }
        if self.stage(side).set_upstream(subscription) {
            debug!(flow = %self.name, side = side.label(), "upstream subscribed");
            self.upstream_window_update(side);
        }
    }

    /// 上游 `on_next`。
    pub(super) fn stage_on_next(&self, side: Side, item: ByteChunks) {
        let stage = self.stage(side);
        let within_window = stage.upstream_window.try_decrement();
        debug_assert!(
            within_window,
            "{} upstream delivered an item without outstanding demand",
            side.label()
        );
        if !within_window {
            self.recycle(item);
            self.handle_error(FlowError::demand_underflow(format!(
                "{} upstream delivered an item without outstanding demand",
                side.label()
            )));
            return;
        }
        if self.is_stopped() {
            self.recycle(item);
            return;
        }
        match side {
            Side::Reader => self.reader_incoming(item, false),
            Side::Writer => self.writer_incoming(item, false),
        }
    }

    /// 上游 `on_complete`，重复调用被忽略。
    pub(super) fn stage_on_complete(&self, side: Side) {
        let stage = self.stage(side);
        if stage.upstream_completed.swap(true, Ordering::AcqRel) {
            warn!(flow = %self.name, side = side.label(), "duplicate upstream completion ignored");
            return;
        }
        debug!(flow = %self.name, side = side.label(), "upstream completed");
        match side {
            Side::Reader => self.reader_incoming(Vec::new(), true),
            Side::Writer => self.writer_incoming(Vec::new(), true),
        }
    }

    /// 上游 `on_error`：读方向的传输错误按握手状态重新归类后统一进入致命错误路径。
    pub(super) fn stage_on_error(&self, side: Side, error: FlowError) {
        self.stage(side)
            .upstream_completed
            .store(true, Ordering::Release);
        let error = match side {
            Side::Reader => self.check_for_handshake(error),
            Side::Writer => error,
        };
        self.handle_error(error);
    }
}
