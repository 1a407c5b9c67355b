//! TLS 流委托：Reader、Writer 与握手协调的组合。
//!
//! # 模块角色（Why）
//! - 传输层只认识密文字节流，应用只认识明文字节流；委托在两者之间各放一个处理方向，
//!   共享同一个 [`TlsEngine`]，并把握手推进、ALPN 锁存与终止信号统一收口；
//! - 每个方向都有独立的 [`SequentialScheduler`](spark_flow::SequentialScheduler)，两个方向可以并发，
//!   同一方向的处理永远单飞。
//!
//! # 拓扑（How）
//! ```text
//!   transport ──密文──▶ upstream_reader ─▶ Reader ─unwrap─▶ reader 下游（应用）
//!   应用 ──明文──▶ upstream_writer ─▶ Writer ─wrap─▶ writer 下游（transport）
//! ```
//!
//! # 终止（What）
//! - 任意位置的第一个错误进入唯一的错误入口：完成信号以该错误解析，
//!   两个方向各向下游投递一次错误，调度器停止，缓冲清空；
//! - 两个方向各自正常结束后，完成信号以成功解析；此时仍未锁定的 ALPN 以
//!   [`FlowError::HandshakeIncomplete`] 失败。

mod handshake;
mod pending;
mod read_buffer;
mod reader;
mod stage;
mod writer;

use std::sync::{
    Arc, OnceLock, Weak,
    atomic::{AtomicBool, Ordering},
};

use spark_buffer::BufferPool;
use spark_flow::{
    ByteChunks, Completion, Executor, FlowError, FlowTube, Publisher, Subscriber, Subscription,
};
use tracing::{debug, warn};

pub use handshake::{HandshakePhase, HandshakeSnapshot};

use self::{handshake::HandshakeState, reader::Reader, stage::Stage, writer::Writer};
use crate::{config::TlsFlowConfig, engine::TlsEngine};

/// 引擎连续报告 `BUFFER_OVERFLOW`（或关闭后持续产出）的容忍次数。
const MAX_OVERFLOW_RETRIES: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Side {
    Reader,
    Writer,
}

impl Side {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Side::Reader => "reader",
            Side::Writer => "writer",
        }
    }
}

/// Reader 推送轮次开始时的回调；Tube 在这里挂接待定订阅者。
pub(crate) trait ReadSchedulingHook: Send + Sync {
    fn on_read_scheduling(&self);
}

pub(crate) struct Shared {
    name: Arc<str>,
    config: TlsFlowConfig,
    engine: Arc<dyn TlsEngine>,
    executor: Arc<dyn Executor>,
    pool: Arc<dyn BufferPool>,
    handshake: HandshakeState,
    reader: Reader,
    writer: Writer,
    alpn: Completion<Option<String>>,
    completion: Completion<()>,
    close_notify_received: AtomicBool,
    stopped: AtomicBool,
    read_hook: OnceLock<Weak<dyn ReadSchedulingHook>>,
    weak: Weak<Shared>,
}

impl Shared {
    fn stage(&self, side: Side) -> &Stage {
        match side {
            Side::Reader => &self.reader.stage,
            Side::Writer => &self.writer.stage,
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// 把可以独占的字节块归还缓冲池，其余直接丢弃。
    fn recycle(&self, chunks: ByteChunks) {
        for chunk in chunks {
            if let Ok(owned) = chunk.try_into_mut() {
                self.pool.release(owned);
            }
        }
    }

    fn enter_read_scheduling(&self) {
        if let Some(hook) = self.read_hook.get().and_then(Weak::upgrade) {
            hook.on_read_scheduling();
        }
    }

    /// 握手被传输层的关闭或失败打断时给出的错误；握手已完成或收到过 close_notify 时为 `None`。
    pub(crate) fn handshake_interruption(&self) -> Option<FlowError> {
        if self.close_notify_received.load(Ordering::Acquire) {
            return None;
        }
        let engine_handshaking = self.engine.handshake_status().is_handshaking();
        match self.handshake.phase() {
            HandshakePhase::Init if engine_handshaking => Some(FlowError::handshake_aborted(
                "remote host closed the channel before handshake",
            )),
            HandshakePhase::Handshaking => Some(FlowError::handshake_aborted(
                "remote host terminated the handshake",
            )),
            _ if engine_handshaking => Some(FlowError::handshake_aborted(
                "remote host terminated the handshake",
            )),
            _ => None,
        }
    }

    /// 握手期间出现的传输错误重新归类为握手中断，保留原始描述。
    fn check_for_handshake(&self, error: FlowError) -> FlowError {
        if error.is_handshake_failure() {
            return error;
        }
        match self.handshake_interruption() {
            Some(interrupted) => FlowError::handshake_aborted(format!(
                "{}: {}",
                interrupted.detail(),
                error
            )),
            None => error,
        }
    }

    /// 再执行一次 Reader 推送轮次；推送已停止时返回 `false`。
    pub(crate) fn resume_reader(&self) -> bool {
        let push = &self.reader.stage.push;
        if push.is_stopped() {
            return false;
        }
        push.run_or_schedule();
        true
    }

    /// 新的明文订阅者接管前清零 Reader 的下游需求。
    pub(crate) fn reset_reader_demand(&self) {
        self.reader.stage.reset_demand();
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// 唯一的致命错误入口。
    pub(crate) fn handle_error(&self, error: FlowError) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            debug!(flow = %self.name, kind = error.kind(), "error after stop ignored: {error}");
            return;
        }
        warn!(flow = %self.name, kind = error.kind(), "flow delegate failed: {error}");
        self.completion.fail(error.clone());
        self.alpn.fail(error.clone());
        self.reader.scheduler.stop();
        self.writer.scheduler.stop();
        self.reader.buffer.lock().clear();
        self.writer.pending.lock().clear();
        self.reader.stage.cancel_upstream();
        self.writer.stage.cancel_upstream();
        self.reader.stage.fail(error.clone());
        self.writer.stage.fail(error);
    }

    /// 下游取消订阅：该方向不再投递，连接完成信号以 `flow.cancelled` 解析，另一方向照常运行。
    fn downstream_cancelled(&self, side: Side) {
        if self.completion.fail(FlowError::Cancelled) {
            debug!(flow = %self.name, side = side.label(), "connection abandoned by downstream");
        }
    }

    /// 两个方向都正常结束后解析完成信号。
    fn normal_stop(&self) {
        let finished = |stage: &Stage| matches!(stage.completion.peek(), Some(Ok(())));
        if !finished(&self.reader.stage) || !finished(&self.writer.stage) {
            return;
        }
        if self.alpn.fail(FlowError::handshake_incomplete(
            "connection closed before successful ALPN negotiation",
        )) {
            debug!(flow = %self.name, "ALPN never negotiated");
        }
        if self.completion.complete(()) {
            self.stopped.store(true, Ordering::Release);
            self.reader.scheduler.stop();
            self.writer.scheduler.stop();
            self.reader.stage.release_upstream();
            self.writer.stage.release_upstream();
            debug!(flow = %self.name, "flow delegate completed");
        }
    }
}

/// 双向 TLS 流委托。
///
/// # 教案式说明
/// - **意图 (Why)**：把一个 [`TlsEngine`] 包装成两条背压流：密文进、明文出（Reader），
///   明文进、密文出（Writer）。
/// - **逻辑 (How)**：
///   - [`TlsFlowDelegate::upstream_reader`] 订阅传输层的读方向，[`TlsFlowDelegate::upstream_writer`]
///     订阅应用的写方向；
///   - [`TlsFlowDelegate::connect`] 同时挂接两个方向的下游，并让 Writer 在引擎需要时主动发起握手；
///   - 委托任务在构造时注入的 [`Executor`] 上运行，Reader/Writer 自身在触发它们的线程上内联执行。
/// - **契约 (What)**：
///   - 每个方向对下游至多投递一次终止信号，且错误总在已获得需求的输出之后；
///   - [`TlsFlowDelegate::completion`] 只解析一次：第一个错误，或两个方向都结束时的成功；
///   - [`TlsFlowDelegate::alpn`] 在握手完成时解析为协商结果，连接在此之前结束则失败。
/// - **风险 (Trade-offs)**：端口对象持有委托的强引用；终止后引用随下游释放而断开，
///   未终止就丢弃全部外部句柄会让委托保持存活直到传输层结束。
pub struct TlsFlowDelegate {
    shared: Arc<Shared>,
}

impl TlsFlowDelegate {
    pub fn new(
        engine: Arc<dyn TlsEngine>,
        executor: Arc<dyn Executor>,
        pool: Arc<dyn BufferPool>,
        config: TlsFlowConfig,
    ) -> Result<Self, FlowError> {
        config.validate()?;
        let name: Arc<str> = Arc::from(config.name.as_str());
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| Shared {
            reader: Reader::new(&name, config.reader_initial_capacity, weak.clone()),
            writer: Writer::new(&name, weak.clone()),
            name: Arc::clone(&name),
            config,
            engine,
            executor,
            pool,
            handshake: HandshakeState::new(),
            alpn: Completion::new(),
            completion: Completion::new(),
            close_notify_received: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            read_hook: OnceLock::new(),
            weak: weak.clone(),
        });
        for side in [Side::Reader, Side::Writer] {
            let weak = Arc::downgrade(&shared);
            shared.stage(side).completion.on_resolved(move |outcome| {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                match outcome {
                    Ok(()) => shared.normal_stop(),
                    Err(FlowError::Cancelled) => shared.downstream_cancelled(side),
                    Err(_) => {}
                }
            });
        }
        debug!(flow = %name, "flow delegate created");
        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 挂接两个方向的下游，并调度一次 Reader 与 Writer。
    pub fn connect(
        &self,
        reader_downstream: Arc<dyn Subscriber<ByteChunks>>,
        writer_downstream: Arc<dyn Subscriber<ByteChunks>>,
    ) {
        self.shared.reader.stage.set_downstream(reader_downstream);
        self.shared.writer.stage.set_downstream(writer_downstream);
        self.start();
    }

    /// 以 `transport` 作为密文两端：Writer 的输出写往 `transport`，`transport` 读到的数据交给 Reader。
    pub fn connect_transport(
        &self,
        reader_downstream: Arc<dyn Subscriber<ByteChunks>>,
        transport: Arc<dyn FlowTube>,
    ) {
        self.shared.reader.stage.set_downstream(reader_downstream);
        transport.connect_flows(self.writer_publisher(), self.upstream_reader());
        self.start();
    }

    fn start(&self) {
        debug!(flow = %self.shared.name, "flow delegate connected");
        self.shared.writer.scheduler.run_or_schedule();
        self.shared.schedule_reader();
    }

    /// 订阅传输层读方向的入口。
    pub fn upstream_reader(&self) -> Arc<dyn Subscriber<ByteChunks>> {
        Arc::new(UpstreamSink {
            shared: Arc::clone(&self.shared),
            side: Side::Reader,
        })
    }

    /// 订阅应用写方向的入口。
    pub fn upstream_writer(&self) -> Arc<dyn Subscriber<ByteChunks>> {
        Arc::new(UpstreamSink {
            shared: Arc::clone(&self.shared),
            side: Side::Writer,
        })
    }

    /// 明文输出：订阅者替换 Reader 的下游，旧下游收到 `on_detach`。
    pub fn reader_publisher(&self) -> Arc<dyn Publisher<ByteChunks>> {
        Arc::new(StagePublisher {
            shared: Arc::clone(&self.shared),
            side: Side::Reader,
        })
    }

    /// 密文输出：订阅者替换 Writer 的下游。
    pub fn writer_publisher(&self) -> Arc<dyn Publisher<ByteChunks>> {
        Arc::new(StagePublisher {
            shared: Arc::clone(&self.shared),
            side: Side::Writer,
        })
    }

    pub fn alpn(&self) -> Completion<Option<String>> {
        self.shared.alpn.clone()
    }

    pub fn completion(&self) -> Completion<()> {
        self.shared.completion.clone()
    }

    pub fn close_notify_received(&self) -> bool {
        self.shared.close_notify_received.load(Ordering::Acquire)
    }

    pub fn handshake_snapshot(&self) -> HandshakeSnapshot {
        self.shared.handshake.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// 以外部错误终止委托。
    pub fn fail(&self, error: FlowError) {
        self.shared.handle_error(error);
    }

    pub(crate) fn set_read_hook(&self, hook: Weak<dyn ReadSchedulingHook>) {
        if self.shared.read_hook.set(hook).is_err() {
            warn!(flow = %self.shared.name, "read scheduling hook already installed");
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl std::fmt::Debug for TlsFlowDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsFlowDelegate")
            .field("name", &self.shared.name)
            .field("handshake", &self.shared.handshake.snapshot())
            .field("stopped", &self.shared.is_stopped())
            .finish()
    }
}

/// 两个方向的上游入口。
struct UpstreamSink {
    shared: Arc<Shared>,
    side: Side,
}

impl Subscriber<ByteChunks> for UpstreamSink {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.shared.stage_on_subscribe(self.side, subscription);
    }

    fn on_next(&self, item: ByteChunks) {
        self.shared.stage_on_next(self.side, item);
    }

    fn on_error(&self, error: FlowError) {
        self.shared.stage_on_error(self.side, error);
    }

    fn on_complete(&self) {
        self.shared.stage_on_complete(self.side);
    }
}

struct StagePublisher {
    shared: Arc<Shared>,
    side: Side,
}

impl Publisher<ByteChunks> for StagePublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<ByteChunks>>) {
        debug!(flow = %self.shared.name, side = self.side.label(), "downstream subscribed");
        self.shared.stage(self.side).set_downstream(subscriber);
    }
}
