//! TLS Tube：把流委托组合成与普通传输同形的双向端点。
//!
//! # 模块角色（Why）
//! - 上层代码面对的是 [`FlowTube`]：订阅它得到读到的字节，让它订阅写发布者以发送字节；
//! - [`TlsTube`] 在内部用一个 [`TlsFlowDelegate`] 连接真实传输，对外仍然是 `FlowTube`，
//!   因此可以出现在任何普通传输可以出现的位置，包括再次嵌套。
//!
//! # 组成（How）
//! - `read_side`：应用订阅者的挂接、替换与终止信号暂存；
//! - `write_side`：应用写发布者出现之前的需求累积与取消策略；
//! - `wrapper`：单次订阅的信号次序状态机。

mod read_side;
mod wrapper;
mod write_side;

use std::{fmt, sync::Arc};

use spark_buffer::BufferPool;
use spark_flow::{
    ByteChunks, Completion, Executor, FlowError, FlowTube, Publisher, Subscriber, Subscription,
};
use tracing::debug;

use self::{
    read_side::ReadSide,
    write_side::{WriteSink, WriteSubscription},
};
use crate::{
    config::TlsFlowConfig,
    delegate::{ReadSchedulingHook, TlsFlowDelegate},
    engine::TlsEngine,
};

/// Tube 读方向的订阅阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TubePhase {
    NoSubscriber,
    /// 订阅者已注册，等待挂接。
    PendingSubscriber,
    Active,
    /// 读方向已经投递终止信号，仅进入一次。
    Finished,
}

/// 以 TLS 加解密包装的双向字节流端点。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方只需把原始传输与引擎交给 [`TlsTube::new`]，之后像使用普通传输一样
///   订阅明文、接入明文写发布者。
/// - **逻辑 (How)**：
///   - 构造时 Writer 立即订阅内部的 `WriteSubscription`，需求在写发布者接入前累积；
///   - Reader 的下游是内部的读方向适配器，应用订阅者经由它挂接与替换；
///   - 传输层通过 [`FlowTube::connect_flows`] 同时接入密文两端。
/// - **契约 (What)**：
///   - 订阅者在收到 `on_subscribe` 之前不会收到任何数据或终止信号；
///   - 传输层在握手进行中结束且未收到 close_notify 时，订阅者收到
///     [`FlowError::HandshakeAborted`] 而不是正常完成；
///   - [`FlowTube::is_finished`] 在读方向投递终止信号后为 `true`。
pub struct TlsTube {
    delegate: TlsFlowDelegate,
    read_side: Arc<ReadSide>,
    write_sink: Arc<WriteSink>,
}

impl TlsTube {
    pub fn new(
        engine: Arc<dyn TlsEngine>,
        executor: Arc<dyn Executor>,
        pool: Arc<dyn BufferPool>,
        transport: Arc<dyn FlowTube>,
        config: TlsFlowConfig,
    ) -> Result<Arc<Self>, FlowError> {
        let policy = config.write_cancel_policy;
        let delegate = TlsFlowDelegate::new(engine, executor, pool, config)?;
        let name: Arc<str> = Arc::from(delegate.name());

        let write_subscription = Arc::new(WriteSubscription::new(Arc::clone(&name), policy));
        let read_side = Arc::new(ReadSide::new(
            delegate.shared(),
            Arc::clone(&write_subscription),
        ));
        let hook: Arc<dyn ReadSchedulingHook> = read_side.clone();
        delegate.set_read_hook(Arc::downgrade(&hook));

        let upstream_writer = delegate.upstream_writer();
        upstream_writer.on_subscribe(write_subscription.clone());
        let write_sink = Arc::new(WriteSink {
            upstream_writer,
            subscription: write_subscription,
        });

        delegate.connect_transport(read_side.clone(), transport);
        debug!(flow = %name, "tls tube connected");
        Ok(Arc::new(Self {
            delegate,
            read_side,
            write_sink,
        }))
    }

    /// 协商出的应用层协议，握手完成时解析一次。
    pub fn alpn(&self) -> Completion<Option<String>> {
        self.delegate.alpn()
    }

    pub fn completion(&self) -> Completion<()> {
        self.delegate.completion()
    }

    pub fn close_notify_received(&self) -> bool {
        self.delegate.close_notify_received()
    }

    pub fn phase(&self) -> TubePhase {
        self.read_side.phase()
    }

    pub fn delegate(&self) -> &TlsFlowDelegate {
        &self.delegate
    }
}

impl fmt::Debug for TlsTube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTube")
            .field("delegate", &self.delegate)
            .field("phase", &self.phase())
            .field(
                "write_connected",
                &self.write_sink.subscription.has_subscription(),
            )
            .finish()
    }
}

impl Publisher<ByteChunks> for TlsTube {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<ByteChunks>>) {
        self.read_side.set_delegate(subscriber);
    }
}

impl Subscriber<ByteChunks> for TlsTube {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.write_sink.on_subscribe(subscription);
    }

    fn on_next(&self, item: ByteChunks) {
        self.write_sink.on_next(item);
    }

    fn on_error(&self, error: FlowError) {
        self.write_sink.on_error(error);
    }

    fn on_complete(&self) {
        self.write_sink.on_complete();
    }
}

impl FlowTube for TlsTube {
    fn connect_flows(
        &self,
        write_publisher: Arc<dyn Publisher<ByteChunks>>,
        read_subscriber: Arc<dyn Subscriber<ByteChunks>>,
    ) {
        self.subscribe(read_subscriber);
        write_publisher.subscribe(self.write_sink.clone());
    }

    fn is_finished(&self) -> bool {
        self.read_side.is_finished()
    }
}
