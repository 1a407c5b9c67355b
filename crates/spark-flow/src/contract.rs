//! 背压流契约。
//!
//! # 模块角色（Why）
//! - 以最小接口描述“发布者 → 订阅 → 订阅者”三方协作，TLS 委托、Tube 组合层与内存传输
//!   都只依赖本模块，互不感知具体实现；
//! - 所有信号均以 `&self` 方法声明，实现方自行选择内部可变性，契约因此保持对象安全。
//!
//! # 信号次序（What）
//! - 订阅者先收到恰好一次 `on_subscribe`，此后 `on_next` 的总次数不超过其通过
//!   [`Subscription::request`] 声明的需求；
//! - `on_error` 与 `on_complete` 互斥且至多一次，之后不再有任何信号；
//! - `on_detach` 表示订阅者被新的订阅者替换，它不是终止信号。

use std::sync::Arc;

use bytes::Bytes;

use crate::FlowError;

/// 一次投递携带的字节块序列，保持逻辑顺序。
pub type ByteChunks = Vec<Bytes>;

/// 订阅句柄：订阅者通过它声明需求或取消。
pub trait Subscription: Send + Sync {
    /// 追加 `n` 个单位的需求；`n == 0` 为误用，实现可以忽略或以错误终止流。
    fn request(&self, n: u64);

    /// 取消订阅，幂等。
    fn cancel(&self);
}

/// 订阅者。
///
/// # 契约说明（What）
/// - 实现方不得在回调内阻塞等待同一条流水线上的其它信号，否则可能死锁；
/// - 回调可在任意线程上被调用，但同一订阅者的回调不会并发执行。
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);

    fn on_next(&self, item: T);

    fn on_error(&self, error: FlowError);

    fn on_complete(&self);

    /// 订阅者被替换时调用；默认不做任何事。
    fn on_detach(&self) {}
}

/// 发布者。
pub trait Publisher<T>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// 双向字节流管道：既是读方向的发布者，又是写方向的订阅者。
///
/// # 教案式说明
/// - **意图 (Why)**：传输层（socket 适配器、内存管道）与 TLS Tube 对上层呈现同一形态，
///   因此 Tube 之间可以相互嵌套。
/// - **契约 (What)**：
///   - `Publisher` 侧产出从对端读到的字节；
///   - `Subscriber` 侧接收要写往对端的字节，按需求向写发布者拉取；
///   - [`FlowTube::connect_flows`] 一次性完成两个方向的挂接；
///   - [`FlowTube::is_finished`] 在读方向已经投递终止信号后返回 `true`。
pub trait FlowTube: Publisher<ByteChunks> + Subscriber<ByteChunks> {
    /// 将 `write_publisher` 的输出写往本管道，同时把读到的数据交给 `read_subscriber`。
    fn connect_flows(
        &self,
        write_publisher: Arc<dyn Publisher<ByteChunks>>,
        read_subscriber: Arc<dyn Subscriber<ByteChunks>>,
    );

    fn is_finished(&self) -> bool;
}

/// 计算字节块序列的总长度。
pub fn remaining(chunks: &[Bytes]) -> usize {
    chunks.iter().map(Bytes::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_sums_all_chunks() {
        let chunks = vec![
            Bytes::from_static(b"abc"),
            Bytes::new(),
            Bytes::from_static(b"de"),
        ];
        assert_eq!(remaining(&chunks), 5);
        assert_eq!(remaining(&[]), 0);
    }
}
