//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为流契约、TLS 委托与 Tube 组合层提供唯一的错误分类，所有失败最终汇聚到同一个
//!   完成信号上，因此必须可 `Clone` 并能在多个订阅者之间重复投递；
//! - 以稳定错误码（[`FlowError::kind`]）对接日志与告警，避免依赖自然语言描述做判定。
//!
//! ## 设计要求（What）
//! - 派生 [`thiserror::Error`]，兼容 `std::error::Error` 生态；
//! - 传输层原始 `io::Error` 以 `Arc` 保存，保留 `source()` 链路的同时满足 `Clone`；
//! - 枚举标注 `#[non_exhaustive]`，后续新增类别不破坏下游匹配。

use std::{borrow::Cow, io, sync::Arc};

use thiserror::Error;

/// 流水线错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把 TLS 引擎失败、握手中断、任务失败、传输失败与背压误用归档为有限类别，
///   方便上层据此决定是否重连或直接放弃连接。
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可跨线程传播；
///   - `Clone` 语义下共享同一个底层 `io::Error`；
///   - 流水线对错误**不做重试**，任何变体一旦投递即代表连接终止。
/// - **设计权衡 (Trade-offs)**：上下文使用 `Cow<'static, str>`，静态描述零分配，
///   动态描述承担一次堆分配换取可读性。
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum FlowError {
    /// TLS 引擎拒绝记录或报告协议违规，包括流结束时残留无法解密的字节。
    #[error("tls protocol failure: {detail}")]
    Protocol { detail: Cow<'static, str> },

    /// 对端在握手完成前关闭或中断了传输。
    #[error("tls handshake aborted: {detail}")]
    HandshakeAborted { detail: Cow<'static, str> },

    /// 连接在握手成功前正常结束，ALPN 等握手产物永远无法得到。
    #[error("tls handshake incomplete: {detail}")]
    HandshakeIncomplete { detail: Cow<'static, str> },

    /// 引擎委托的计算任务失败或 panic。
    #[error("delegated task failed: {detail}")]
    Task { detail: Cow<'static, str> },

    /// 底层传输报告的失败。
    ///
    /// - **契约 (What)**：`source` 仅在错误源自 `io::Error` 时存在。
    #[error("transport failure: {detail}")]
    Transport {
        detail: Cow<'static, str>,
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// 对零需求执行递减，属于调用方误用。
    #[error("demand underflow: {detail}")]
    DemandUnderflow { detail: Cow<'static, str> },

    /// 在已关闭的流上继续投递数据。
    #[error("flow closed: {detail}")]
    Closed { detail: Cow<'static, str> },

    /// 订阅被取消。
    #[error("subscription cancelled")]
    Cancelled,

    /// 配置非法。
    #[error("invalid configuration: {detail}")]
    Config { detail: Cow<'static, str> },

    /// 内部不变量被破坏。
    ///
    /// - **风险 (Trade-offs)**：出现即代表实现缺陷，日志中应保留完整上下文以便复盘。
    #[error("internal invariant violated: {detail}")]
    Internal { detail: Cow<'static, str> },
}

impl FlowError {
    pub fn protocol(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::Protocol {
            detail: detail.into(),
        }
    }

    pub fn handshake_aborted(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::HandshakeAborted {
            detail: detail.into(),
        }
    }

    pub fn handshake_incomplete(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::HandshakeIncomplete {
            detail: detail.into(),
        }
    }

    pub fn task(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::Task {
            detail: detail.into(),
        }
    }

    pub fn transport(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::Transport {
            detail: detail.into(),
            source: None,
        }
    }

    pub fn demand_underflow(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::DemandUnderflow {
            detail: detail.into(),
        }
    }

    pub fn closed(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::Closed {
            detail: detail.into(),
        }
    }

    pub fn config(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::Config {
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }

    /// 返回稳定的错误码，格式为 `<领域>.<语义>`。
    ///
    /// # 契约说明（What）
    /// - 错误码一经发布即不可修改，日志检索与告警规则依赖其字面值。
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol { .. } => "tls.protocol",
            Self::HandshakeAborted { .. } => "tls.handshake_aborted",
            Self::HandshakeIncomplete { .. } => "tls.handshake_incomplete",
            Self::Task { .. } => "tls.delegated_task",
            Self::Transport { .. } => "transport.io",
            Self::DemandUnderflow { .. } => "flow.demand_underflow",
            Self::Closed { .. } => "flow.closed",
            Self::Cancelled => "flow.cancelled",
            Self::Config { .. } => "config.invalid",
            Self::Internal { .. } => "flow.internal",
        }
    }

    /// 握手阶段的失败（中断或未完成）。
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Self::HandshakeAborted { .. } | Self::HandshakeIncomplete { .. }
        )
    }

    /// 返回人类可读的上下文描述，`Cancelled` 无上下文时返回固定文本。
    pub fn detail(&self) -> &str {
        match self {
            Self::Protocol { detail }
            | Self::HandshakeAborted { detail }
            | Self::HandshakeIncomplete { detail }
            | Self::Task { detail }
            | Self::Transport { detail, .. }
            | Self::DemandUnderflow { detail }
            | Self::Closed { detail }
            | Self::Config { detail }
            | Self::Internal { detail } => &**detail,
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<io::Error> for FlowError {
    fn from(err: io::Error) -> Self {
        Self::Transport {
            detail: Cow::Owned(err.to_string()),
            source: Some(Arc::new(err)),
        }
    }
}
