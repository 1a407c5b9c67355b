//! 记录全部信号的订阅者。

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use spark_flow::{ByteChunks, FlowError, Subscriber, Subscription};

/// 订阅者观察到的一条信号。
#[derive(Clone, Debug)]
pub enum Event {
    Subscribed,
    Next(ByteChunks),
    Error(FlowError),
    Complete,
    Detached,
}

/// 错误按 `kind` 与 `detail` 比较，`FlowError` 本身不实现 `PartialEq`。
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Subscribed, Self::Subscribed)
            | (Self::Complete, Self::Complete)
            | (Self::Detached, Self::Detached) => true,
            (Self::Next(a), Self::Next(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => a.kind() == b.kind() && a.detail() == b.detail(),
            _ => false,
        }
    }
}

#[derive(Default)]
struct RecordingState {
    subscription: Option<Arc<dyn Subscription>>,
    events: Vec<Event>,
}

/// 按构造时的需求策略请求数据，并记录收到的每一个信号。
///
/// # 教案式说明
/// - **意图 (Why)**：集成测试需要同时断言信号次序、字节内容与背压行为，
///   单一替身覆盖三种需求模式即可满足。
/// - **契约 (What)**：
///   - [`RecordingSubscriber::unbounded`] 在 `on_subscribe` 时请求 `u64::MAX`；
///   - [`RecordingSubscriber::with_demand`] 只请求一次 `n`，后续由测试调用 [`RecordingSubscriber::request`]；
///   - [`RecordingSubscriber::manual`] 不主动请求；
///   - `wait_*` 系列在条件满足或超时后返回，超时返回 `false`。
pub struct RecordingSubscriber {
    initial_demand: u64,
    state: Mutex<RecordingState>,
    changed: Condvar,
}

impl RecordingSubscriber {
    pub fn unbounded() -> Arc<Self> {
        Self::with_demand(u64::MAX)
    }

    pub fn with_demand(n: u64) -> Arc<Self> {
        Arc::new(Self {
            initial_demand: n,
            state: Mutex::new(RecordingState::default()),
            changed: Condvar::new(),
        })
    }

    pub fn manual() -> Arc<Self> {
        Self::with_demand(0)
    }

    pub fn request(&self, n: u64) {
        let subscription = self.state.lock().subscription.clone();
        if let Some(subscription) = subscription {
            subscription.request(n);
        }
    }

    pub fn cancel(&self) {
        let subscription = self.state.lock().subscription.clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// 按到达顺序拼接全部数据。
    pub fn collected(&self) -> Bytes {
        let state = self.state.lock();
        let mut out = BytesMut::new();
        for event in &state.events {
            if let Event::Next(chunks) = event {
                for chunk in chunks {
                    out.extend_from_slice(chunk);
                }
            }
        }
        out.freeze()
    }

    /// 每次 `on_next` 携带的字节块序列。
    pub fn items(&self) -> Vec<ByteChunks> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|event| match event {
                Event::Next(chunks) => Some(chunks.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_completed(&self) -> bool {
        self.state
            .lock()
            .events
            .iter()
            .any(|event| matches!(event, Event::Complete))
    }

    pub fn error(&self) -> Option<FlowError> {
        self.state.lock().events.iter().find_map(|event| match event {
            Event::Error(err) => Some(err.clone()),
            _ => None,
        })
    }

    /// 收到的终止信号（完成或错误）数量，正确实现下至多为 1。
    pub fn terminal_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|event| matches!(event, Event::Complete | Event::Error(_)))
            .count()
    }

    /// 等待累计收到至少 `len` 个字节。
    pub fn wait_for_bytes(&self, len: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |events| {
            let received: usize = events
                .iter()
                .map(|event| match event {
                    Event::Next(chunks) => spark_flow::remaining(chunks),
                    _ => 0,
                })
                .sum();
            received >= len
        })
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&[Event]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !done(&state.events) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return done(&state.events);
            }
        }
        true
    }

    fn record(&self, event: Event) {
        self.state.lock().events.push(event);
        self.changed.notify_all();
    }
}

impl Subscriber<ByteChunks> for RecordingSubscriber {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        {
            let mut state = self.state.lock();
            state.subscription = Some(Arc::clone(&subscription));
            state.events.push(Event::Subscribed);
        }
        self.changed.notify_all();
        if self.initial_demand > 0 {
            subscription.request(self.initial_demand);
        }
    }

    fn on_next(&self, item: ByteChunks) {
        self.record(Event::Next(item));
    }

    fn on_error(&self, error: FlowError) {
        self.record(Event::Error(error));
    }

    fn on_complete(&self) {
        self.record(Event::Complete);
    }

    fn on_detach(&self) {
        self.record(Event::Detached);
    }
}
