//! Tube 写方向：在明文写发布者出现之前累积 Writer 的需求。

use std::sync::Arc;

use parking_lot::Mutex;
use spark_flow::{ByteChunks, FlowError, Subscriber, Subscription};
use tracing::debug;

use crate::config::WriteCancelPolicy;

/// Writer 上游看到的订阅句柄，背后是应用写发布者的真实订阅（可能尚不存在）。
///
/// # 教案式说明
/// - **意图 (Why)**：Writer 在构造时就需要一个上游订阅来声明需求，而应用的写发布者
///   可能很久之后才通过 `connect_flows` 接入。
/// - **契约 (What)**：
///   - 真实订阅出现前的 `request(n)` 累加（饱和）并在接入时一次性重放；
///   - 新订阅替换旧订阅时取消旧订阅；
///   - `cancel` 按 [`WriteCancelPolicy`] 处理：`Propagate` 取消当前及之后接入的订阅，
///     `Inert` 只记录日志。
pub(crate) struct WriteSubscription {
    name: Arc<str>,
    policy: WriteCancelPolicy,
    state: Mutex<WriteState>,
}

#[derive(Default)]
struct WriteState {
    subscription: Option<Arc<dyn Subscription>>,
    accumulated: u64,
    cancelled: bool,
}

impl WriteSubscription {
    pub(crate) fn new(name: Arc<str>, policy: WriteCancelPolicy) -> Self {
        Self {
            name,
            policy,
            state: Mutex::new(WriteState::default()),
        }
    }

    /// 接入应用写发布者的订阅。
    pub(crate) fn set_subscription(&self, subscription: Arc<dyn Subscription>) {
        let (previous, replay) = {
            let mut state = self.state.lock();
            if state.cancelled {
                drop(state);
                debug!(flow = %self.name, "write side already cancelled, rejecting new subscription");
                subscription.cancel();
                return;
            }
            let previous = state.subscription.replace(Arc::clone(&subscription));
            (previous, std::mem::take(&mut state.accumulated))
        };
        if let Some(previous) = previous {
            debug!(flow = %self.name, "write publisher replaced, cancelling previous subscription");
            previous.cancel();
        }
        if replay > 0 {
            debug!(flow = %self.name, replay, "replaying accumulated write demand");
            subscription.request(replay);
        }
    }

    pub(crate) fn has_subscription(&self) -> bool {
        self.state.lock().subscription.is_some()
    }
}

impl Subscription for WriteSubscription {
    fn request(&self, n: u64) {
        let current = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            match &state.subscription {
                Some(subscription) => Arc::clone(subscription),
                None => {
                    state.accumulated = state.accumulated.saturating_add(n);
                    return;
                }
            }
        };
        current.request(n);
    }

    fn cancel(&self) {
        match self.policy {
            WriteCancelPolicy::Inert => {
                debug!(flow = %self.name, "write cancel ignored by policy");
            }
            WriteCancelPolicy::Propagate => {
                let current = {
                    let mut state = self.state.lock();
                    if state.cancelled {
                        return;
                    }
                    state.cancelled = true;
                    state.accumulated = 0;
                    state.subscription.take()
                };
                debug!(flow = %self.name, "write side cancelled");
                if let Some(current) = current {
                    current.cancel();
                }
            }
        }
    }
}

/// Tube 对应用写发布者呈现的订阅者：订阅交给 [`WriteSubscription`]，数据与终止信号交给 Writer。
pub(crate) struct WriteSink {
    pub(crate) upstream_writer: Arc<dyn Subscriber<ByteChunks>>,
    pub(crate) subscription: Arc<WriteSubscription>,
}

impl Subscriber<ByteChunks> for WriteSink {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.subscription.set_subscription(subscription);
    }

    fn on_next(&self, item: ByteChunks) {
        self.upstream_writer.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.upstream_writer.on_error(error);
    }

    fn on_complete(&self) {
        self.upstream_writer.on_complete();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    };

    use spark_flow::Subscription;

    use super::WriteSubscription;
    use crate::config::WriteCancelPolicy;

    #[derive(Default)]
    struct CountingSubscription {
        requested: AtomicU64,
        cancelled: AtomicBool,
    }

    impl Subscription for CountingSubscription {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }
        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn demand_before_subscription_is_replayed_once() {
        let write = WriteSubscription::new(Arc::from("t"), WriteCancelPolicy::Propagate);
        write.request(2);
        write.request(3);
        let upstream = Arc::new(CountingSubscription::default());
        write.set_subscription(upstream.clone());
        assert_eq!(upstream.requested.load(Ordering::SeqCst), 5, "累积需求应合并为一次请求");
        write.request(1);
        assert_eq!(upstream.requested.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn replacing_subscription_cancels_previous() {
        let write = WriteSubscription::new(Arc::from("t"), WriteCancelPolicy::Inert);
        let first = Arc::new(CountingSubscription::default());
        let second = Arc::new(CountingSubscription::default());
        write.set_subscription(first.clone());
        write.set_subscription(second.clone());
        assert!(first.cancelled.load(Ordering::SeqCst));
        assert!(!second.cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_follows_policy() {
        let inert = WriteSubscription::new(Arc::from("t"), WriteCancelPolicy::Inert);
        let upstream = Arc::new(CountingSubscription::default());
        inert.set_subscription(upstream.clone());
        inert.cancel();
        assert!(!upstream.cancelled.load(Ordering::SeqCst), "Inert 策略不得取消写发布者");

        let propagate = WriteSubscription::new(Arc::from("t"), WriteCancelPolicy::Propagate);
        propagate.cancel();
        let late = Arc::new(CountingSubscription::default());
        propagate.set_subscription(late.clone());
        assert!(late.cancelled.load(Ordering::SeqCst), "取消后接入的订阅应立即取消");
    }
}
