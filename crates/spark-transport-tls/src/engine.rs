//! TLS 引擎能力抽象。
//!
//! # 模块角色（Why）
//! - 记录层加解密、密钥协商与证书校验都属于引擎内部细节，流封装只关心
//!   “喂入多少、产出多少、握手还差什么”；
//! - 以 trait 对象形式注入，生产环境使用 [`RustlsEngine`](crate::RustlsEngine)，
//!   测试使用 [`ToyEngine`](crate::test_stubs::ToyEngine) 等脚本化替身。
//!
//! # 契约说明（What）
//! - 单个连接只有一个引擎实例，Reader 与 Writer 可能并发调用 `wrap`/`unwrap`，
//!   实现需自行串行化（通常是内部互斥锁）；
//! - `wrap`/`unwrap` 只向 `dst` **追加**字节，且追加量等于 `bytes_produced`；
//! - `dst` 剩余容量不足以容纳一条输出记录时返回 [`EngineStatus::BufferOverflow`]，
//!   此时不得消费任何输入；
//! - 输入不足一条完整记录时返回 [`EngineStatus::BufferUnderflow`]，同样不消费输入。

use bytes::{Bytes, BytesMut};
use spark_flow::FlowError;

/// 一次 `wrap`/`unwrap` 的结果状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// 输入不足一条完整记录。
    BufferUnderflow,
    /// 目标缓冲剩余容量不足。
    BufferOverflow,
    /// 对应方向已经关闭。
    Closed,
}

/// 握手推进状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    /// 本次调用恰好完成了握手；只会出现在 [`EngineResult`] 中。
    Finished,
    /// 需要执行委托任务。
    NeedTask,
    NeedWrap,
    NeedUnwrap,
    NeedUnwrapAgain,
}

impl HandshakeStatus {
    pub fn is_handshaking(self) -> bool {
        !matches!(self, Self::NotHandshaking | Self::Finished)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

impl EngineResult {
    pub fn new(
        status: EngineStatus,
        handshake_status: HandshakeStatus,
        bytes_consumed: usize,
        bytes_produced: usize,
    ) -> Self {
        Self {
            status,
            handshake_status,
            bytes_consumed,
            bytes_produced,
        }
    }

    /// 本次结果是否仍处于握手中；方向已关闭时不再视为握手。
    pub fn handshaking(&self) -> bool {
        self.status != EngineStatus::Closed && self.handshake_status.is_handshaking()
    }
}

/// 引擎委托给调用方执行的握手任务（例如证书链校验）。
pub type DelegatedTask = Box<dyn FnOnce() -> Result<(), FlowError> + Send>;

/// TLS 引擎能力。
///
/// # 教案式说明
/// - **意图 (Why)**：把“记录层协议”与“背压流水线”解耦，流水线不理解任何密码学细节。
/// - **契约 (What)**：
///   - 所有方法以 `&self` 调用，实现方使用内部可变性；
///   - 任意方法返回 `Err` 都视为致命错误，流水线不会重试；
///   - [`TlsEngine::close_outbound`] 请求发送 close_notify，之后 `handshake_status()` 应报告
///     [`HandshakeStatus::NeedWrap`] 直到告警被 `wrap` 产出。
/// - **风险 (Trade-offs)**：`wrap` 接收字节块切片而非连续缓冲，实现方可能需要一次拷贝。
pub trait TlsEngine: Send + Sync {
    fn wrap(&self, src: &[Bytes], dst: &mut BytesMut) -> Result<EngineResult, FlowError>;

    fn unwrap(&self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, FlowError>;

    fn handshake_status(&self) -> HandshakeStatus;

    /// 取出当前待执行的委托任务；没有任务时返回空集合。
    fn drain_delegated_tasks(&self) -> Vec<DelegatedTask>;

    fn is_inbound_done(&self) -> bool;

    fn is_outbound_done(&self) -> bool;

    /// 协商出的应用层协议（ALPN）；未协商或握手未完成时为 `None`。
    fn application_protocol(&self) -> Option<String>;

    /// 单条记录解密后的最大明文长度。
    fn application_buffer_size(&self) -> usize;

    /// 单条记录加密后的最大长度。
    fn packet_buffer_size(&self) -> usize;

    fn close_outbound(&self) {}
}
