//! 内存传输与可编程发布者。
//!
//! # 设计定位（Why）
//! - 流委托与 Tube 的测试需要一个遵守需求计数的字节源，以及一个能观察写出内容的字节汇；
//! - [`MemoryTransport::pair`] 把两端的写方向交叉连接到对方的读方向，
//!   可以在单进程内跑完整的客户端/服务端握手。
//!
//! # 行为描述（How）
//! - 发布方向共用 `Emitter`：条目排队，需求到达后由 [`SequentialScheduler`] 单飞投递；
//! - 终止信号排在所有已入队条目之后，仅投递一次；
//! - 取消后丢弃队列并忽略之后的推送。

use std::{
    collections::VecDeque,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use spark_flow::{
    ByteChunks, Demand, FlowError, FlowTube, Publisher, SequentialScheduler, Subscriber,
    Subscription,
};
use tracing::{debug, trace};

#[derive(Default)]
struct EmitterState {
    items: VecDeque<ByteChunks>,
    terminal: Option<Result<(), FlowError>>,
    terminal_delivered: bool,
    subscriber: Option<Arc<dyn Subscriber<ByteChunks>>>,
    cancelled: bool,
}

struct Emitter {
    name: String,
    state: Mutex<EmitterState>,
    demand: Demand,
    requested: AtomicU64,
    scheduler: Arc<SequentialScheduler>,
}

impl Emitter {
    fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            Self {
                scheduler: SequentialScheduler::new(format!("{name}-emitter"), move || {
                    if let Some(emitter) = weak.upgrade() {
                        emitter.pump();
                    }
                }),
                name,
                state: Mutex::new(EmitterState::default()),
                demand: Demand::new(),
                requested: AtomicU64::new(0),
            }
        })
    }

    fn subscribe(self: &Arc<Self>, subscriber: Arc<dyn Subscriber<ByteChunks>>) {
        let previous = self.state.lock().subscriber.replace(Arc::clone(&subscriber));
        if previous.is_some() {
            debug!(emitter = %self.name, "emitter subscriber replaced");
        }
        subscriber.on_subscribe(Arc::new(EmitterSubscription {
            emitter: Arc::downgrade(self),
        }));
        self.scheduler.run_or_schedule();
    }

    fn push(&self, item: ByteChunks) {
        {
            let mut state = self.state.lock();
            if state.cancelled || state.terminal.is_some() {
                trace!(emitter = %self.name, "push after cancel or terminal ignored");
                return;
            }
            state.items.push_back(item);
        }
        self.scheduler.run_or_schedule();
    }

    fn terminate(&self, outcome: Result<(), FlowError>) {
        {
            let mut state = self.state.lock();
            if state.cancelled || state.terminal.is_some() {
                return;
            }
            state.terminal = Some(outcome);
        }
        self.scheduler.run_or_schedule();
    }

    fn pump(&self) {
        loop {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            let Some(subscriber) = state.subscriber.clone() else {
                return;
            };
            if !state.items.is_empty() {
                if !self.demand.try_decrement() {
                    return;
                }
                let Some(item) = state.items.pop_front() else {
                    return;
                };
                drop(state);
                subscriber.on_next(item);
                continue;
            }
            if state.terminal_delivered {
                return;
            }
            let Some(outcome) = state.terminal.clone() else {
                return;
            };
            state.terminal_delivered = true;
            drop(state);
            match outcome {
                Ok(()) => subscriber.on_complete(),
                Err(err) => subscriber.on_error(err),
            }
            return;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn is_terminated(&self) -> bool {
        self.state.lock().terminal_delivered
    }
}

struct EmitterSubscription {
    emitter: Weak<Emitter>,
}

impl Subscription for EmitterSubscription {
    fn request(&self, n: u64) {
        let Some(emitter) = self.emitter.upgrade() else {
            return;
        };
        if emitter.demand.increase(n).is_err() {
            debug!(emitter = %emitter.name, "request(0) ignored");
            return;
        }
        let _ = emitter
            .requested
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            });
        emitter.scheduler.run_or_schedule();
    }

    fn cancel(&self) {
        let Some(emitter) = self.emitter.upgrade() else {
            return;
        };
        let mut state = emitter.state.lock();
        if !state.cancelled {
            debug!(emitter = %emitter.name, "emitter cancelled");
            state.cancelled = true;
            state.items.clear();
        }
    }
}

/// 测试控制推送节奏的发布者。
///
/// - **契约 (What)**：推送的条目只在订阅者需求允许时投递；`complete`/`fail` 排在已推送条目之后。
pub struct QueuePublisher {
    emitter: Arc<Emitter>,
}

impl QueuePublisher {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            emitter: Emitter::new(name),
        })
    }

    pub fn push(&self, chunks: ByteChunks) {
        self.emitter.push(chunks);
    }

    pub fn push_bytes(&self, bytes: &'static [u8]) {
        self.emitter.push(vec![Bytes::from_static(bytes)]);
    }

    pub fn complete(&self) {
        self.emitter.terminate(Ok(()));
    }

    pub fn fail(&self, error: FlowError) {
        self.emitter.terminate(Err(error));
    }

    pub fn is_cancelled(&self) -> bool {
        self.emitter.is_cancelled()
    }

    /// 订阅者累计请求的需求量（在 `u64::MAX` 处饱和）。
    pub fn requested(&self) -> u64 {
        self.emitter.requested.load(Ordering::Acquire)
    }

    /// 尚未投递的条目数。
    pub fn queued(&self) -> usize {
        self.emitter.state.lock().items.len()
    }
}

impl Publisher<ByteChunks> for QueuePublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<ByteChunks>>) {
        self.emitter.subscribe(subscriber);
    }
}

#[derive(Default)]
struct WriteRecord {
    written: Vec<Bytes>,
    error: Option<FlowError>,
}

/// 内存中的 [`FlowTube`]。
///
/// # 教案式说明
/// - **意图 (Why)**：代替真实 socket 作为流委托的下层传输，读方向由测试（或对端）喂入，
///   写方向全部记录下来供断言。
/// - **逻辑 (How)**：
///   - 读方向是一个 `Emitter`，遵守订阅者的需求；
///   - 写方向订阅时一次性请求 `u64::MAX`，收到的字节追加到记录并转发给对端（若已配对）；
///   - 写方向正常结束时对端读方向随之完成，写方向出错时对端读方向以传输错误结束。
pub struct MemoryTransport {
    this: Weak<MemoryTransport>,
    inbound: Arc<Emitter>,
    write: Mutex<WriteRecord>,
    peer: OnceLock<Weak<MemoryTransport>>,
}

impl MemoryTransport {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            inbound: Emitter::new(name),
            write: Mutex::new(WriteRecord::default()),
            peer: OnceLock::new(),
        })
    }

    /// 一对交叉连接的传输：一端写出的字节成为另一端读到的字节。
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let left = Self::new("memory-left");
        let right = Self::new("memory-right");
        let _ = left.peer.set(Arc::downgrade(&right));
        let _ = right.peer.set(Arc::downgrade(&left));
        (left, right)
    }

    pub fn push_inbound(&self, chunks: ByteChunks) {
        self.inbound.push(chunks);
    }

    pub fn push_inbound_bytes(&self, bytes: Bytes) {
        self.inbound.push(vec![bytes]);
    }

    pub fn complete_inbound(&self) {
        self.inbound.terminate(Ok(()));
    }

    pub fn fail_inbound(&self, error: FlowError) {
        self.inbound.terminate(Err(error));
    }

    /// 按顺序拼接的全部写出字节。
    pub fn written(&self) -> Bytes {
        let write = self.write.lock();
        let mut out = BytesMut::new();
        for chunk in &write.written {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }

    pub fn write_error(&self) -> Option<FlowError> {
        self.write.lock().error.clone()
    }

    fn peer(&self) -> Option<Arc<MemoryTransport>> {
        self.peer.get().and_then(Weak::upgrade)
    }
}

impl Publisher<ByteChunks> for MemoryTransport {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<ByteChunks>>) {
        self.inbound.subscribe(subscriber);
    }
}

impl Subscriber<ByteChunks> for MemoryTransport {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        subscription.request(u64::MAX);
    }

    fn on_next(&self, item: ByteChunks) {
        self.write.lock().written.extend(item.iter().cloned());
        if let Some(peer) = self.peer() {
            peer.push_inbound(item);
        }
    }

    fn on_error(&self, error: FlowError) {
        self.write.lock().error = Some(error.clone());
        if let Some(peer) = self.peer() {
            peer.fail_inbound(FlowError::transport(format!("peer write failed: {error}")));
        }
    }

    fn on_complete(&self) {
        if let Some(peer) = self.peer() {
            peer.complete_inbound();
        }
    }
}

impl FlowTube for MemoryTransport {
    fn connect_flows(
        &self,
        write_publisher: Arc<dyn Publisher<ByteChunks>>,
        read_subscriber: Arc<dyn Subscriber<ByteChunks>>,
    ) {
        self.subscribe(read_subscriber);
        if let Some(this) = self.this.upgrade() {
            write_publisher.subscribe(this);
        }
    }

    fn is_finished(&self) -> bool {
        self.inbound.is_terminated()
    }
}
