//! Tube 读方向：把委托 Reader 的单一下游扩展为可替换、可晚到的应用订阅者。
//!
//! # 模块角色（Why）
//! - 应用订阅者可能在传输层订阅建立之前或之后注册，也可能被新的订阅者替换；
//! - 传输层的终止信号可能早于任何订阅者到来，必须暂存并在订阅者收到 `on_subscribe`
//!   之后重放。
//!
//! # 挂接时机（How）
//! - 新订阅者先放入 `pending`，随后请求一次 Reader 推送轮次；
//! - 推送轮次开始时的钩子执行真正的挂接，因此 `on_subscribe` 与 `on_next` 不会交错；
//! - Reader 推送已经停止（错误已投递）时由注册线程直接挂接。
//!
//! # 契约（What）
//! - 错误重放给之后注册的每一个订阅者，完成信号只交给第一个观察到它的订阅者；
//! - 读方向投递终止信号后，按 [`WriteCancelPolicy`](crate::WriteCancelPolicy) 取消写方向，
//!   `finished` 仅置位一次。

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::Mutex;
use spark_flow::{ByteChunks, FlowError, Subscriber, Subscription};
use tracing::{debug, trace, warn};

use super::{
    TubePhase,
    wrapper::{DelegateWrapper, ReadSubscription},
    write_side::WriteSubscription,
};
use crate::delegate::{ReadSchedulingHook, Shared};

#[derive(Default)]
struct ReadState {
    pending: Option<Arc<DelegateWrapper>>,
    active: Option<Arc<DelegateWrapper>>,
    subscription: Option<Arc<dyn Subscription>>,
    error: Option<FlowError>,
    completed: bool,
    completion_delivered: bool,
}

pub(crate) struct ReadSide {
    name: Arc<str>,
    shared: Weak<Shared>,
    write: Arc<WriteSubscription>,
    state: Mutex<ReadState>,
    finished: AtomicBool,
}

impl ReadSide {
    pub(crate) fn new(shared: &Arc<Shared>, write: Arc<WriteSubscription>) -> Self {
        Self {
            name: Arc::from(shared.name()),
            shared: Arc::downgrade(shared),
            write,
            state: Mutex::new(ReadState::default()),
            finished: AtomicBool::new(false),
        }
    }

    /// 注册新的应用订阅者；真正的挂接发生在下一次 Reader 推送轮次。
    pub(crate) fn set_delegate(&self, subscriber: Arc<dyn Subscriber<ByteChunks>>) {
        let wrapper = Arc::new(DelegateWrapper::new(subscriber));
        let replaced = self.state.lock().pending.replace(wrapper);
        if let Some(replaced) = replaced {
            debug!(flow = %self.name, "pending subscriber replaced before hookup");
            replaced.detach();
        }
        debug!(flow = %self.name, "subscriber registered");
        let resumed = self
            .shared
            .upgrade()
            .is_some_and(|shared| shared.resume_reader());
        if !resumed {
            self.process_pending_subscriber();
        }
    }

    /// 挂接待定订阅者：旧订阅者先被分离，新订阅者收到 `on_subscribe` 后立即重放暂存的终止信号。
    fn process_pending_subscriber(&self) {
        let (wrapper, previous, subscription, error, replay_complete) = {
            let mut state = self.state.lock();
            let Some(subscription) = state.subscription.clone() else {
                return;
            };
            let Some(wrapper) = state.pending.take() else {
                return;
            };
            let previous = state.active.replace(Arc::clone(&wrapper));
            let replay_complete =
                state.error.is_none() && state.completed && !state.completion_delivered;
            if replay_complete {
                state.completion_delivered = true;
            }
            (
                wrapper,
                previous,
                subscription,
                state.error.clone(),
                replay_complete,
            )
        };
        if let Some(previous) = previous {
            debug!(flow = %self.name, "previous subscriber detached");
            previous.detach();
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.reset_reader_demand();
        }
        trace!(flow = %self.name, "hooking up subscriber");
        wrapper.on_subscribe(Arc::new(ReadSubscription::new(&wrapper, subscription)));
        if let Some(error) = error {
            debug!(flow = %self.name, kind = error.kind(), "replaying error to new subscriber");
            wrapper.on_error(error);
        } else if replay_complete {
            debug!(flow = %self.name, "replaying completion to new subscriber");
            wrapper.on_complete();
        }
    }

    fn active(&self) -> Option<Arc<DelegateWrapper>> {
        self.state.lock().active.clone()
    }

    fn deliver_error(&self, error: FlowError) {
        let active = {
            let mut state = self.state.lock();
            if state.error.is_none() {
                state.error = Some(error.clone());
            }
            state.active.clone()
        };
        match active {
            Some(active) => active.on_error(error),
            None => debug!(flow = %self.name, kind = error.kind(), "error parked until a subscriber arrives"),
        }
        self.finish();
    }

    /// 读方向终止：只执行一次，随后按策略取消写方向。
    fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(flow = %self.name, "tube read side finished");
        self.write.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn phase(&self) -> TubePhase {
        if self.is_finished() {
            return TubePhase::Finished;
        }
        let state = self.state.lock();
        if state.pending.is_some() {
            TubePhase::PendingSubscriber
        } else if state.active.is_some() {
            TubePhase::Active
        } else {
            TubePhase::NoSubscriber
        }
    }
}

impl ReadSchedulingHook for ReadSide {
    fn on_read_scheduling(&self) {
        self.process_pending_subscriber();
    }
}

impl Subscriber<ByteChunks> for ReadSide {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let previous = self.state.lock().subscription.replace(subscription);
        if previous.is_some() {
            warn!(flow = %self.name, "reader subscription replaced");
        }
        self.process_pending_subscriber();
    }

    fn on_next(&self, item: ByteChunks) {
        match self.active() {
            Some(active) => active.on_next(item),
            None => warn!(
                flow = %self.name,
                bytes = spark_flow::remaining(&item),
                "plaintext without subscriber dropped"
            ),
        }
    }

    fn on_error(&self, error: FlowError) {
        self.deliver_error(error);
    }

    fn on_complete(&self) {
        if let Some(shared) = self.shared.upgrade()
            && let Some(error) = shared.handshake_interruption()
        {
            shared.handle_error(error.clone());
            self.deliver_error(error);
            return;
        }
        let active = {
            let mut state = self.state.lock();
            state.completed = true;
            let active = state.active.clone();
            if active.is_some() {
                state.completion_delivered = true;
            }
            active
        };
        match active {
            Some(active) => active.on_complete(),
            None => debug!(flow = %self.name, "completion parked until a subscriber arrives"),
        }
        self.finish();
    }
}
