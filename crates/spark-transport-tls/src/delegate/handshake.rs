//! 握手协调。
//!
//! # 模块角色（Why）
//! - Reader 与 Writer 各自独立调度，却共享同一个引擎的握手进度：一方观察到的
//!   `NEED_WRAP`/`NEED_UNWRAP` 往往需要唤醒另一方，`NEED_TASK` 则只能由一方认领执行；
//! - 本模块集中维护握手阶段原子量，并实现“认领任务、执行任务、恢复双方”的完整链路。
//!
//! # 状态编码（How）
//! - 低两位为阶段：`NOT_HANDSHAKING`、`HANDSHAKING`、`INIT`；
//! - 第三位 `RUNNING_TASKS` 与阶段正交，只能通过原子 `fetch_or` 认领。

use std::{
    panic::{self, AssertUnwindSafe},
    sync::atomic::{AtomicU8, Ordering},
};

use spark_flow::FlowError;
use tracing::{debug, trace};

use super::{Shared, Side};
use crate::engine::{DelegatedTask, HandshakeStatus};

const PHASE_MASK: u8 = 0b011;
const NOT_HANDSHAKING: u8 = 0;
const HANDSHAKING: u8 = 1;
const INIT: u8 = 2;
const RUNNING_TASKS: u8 = 0b100;

/// 握手阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakePhase {
    NotHandshaking,
    Handshaking,
    /// 引擎尚未报告任何握手进展。
    Init,
}

/// 握手状态快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeSnapshot {
    pub phase: HandshakePhase,
    pub running_tasks: bool,
}

fn decode(raw: u8) -> HandshakePhase {
    match raw & PHASE_MASK {
        HANDSHAKING => HandshakePhase::Handshaking,
        INIT => HandshakePhase::Init,
        _ => HandshakePhase::NotHandshaking,
    }
}

/// 阶段与任务位打包在同一个原子量中的握手状态。
///
/// - **契约 (What)**：所有更新都保留与自身无关的位；`try_claim_tasks` 只有一个调用者能成功，
///   直到 `release_tasks` 清除该位。
#[derive(Debug)]
pub(crate) struct HandshakeState {
    raw: AtomicU8,
}

impl HandshakeState {
    pub(crate) fn new() -> Self {
        Self {
            raw: AtomicU8::new(INIT),
        }
    }

    /// 进入 `HANDSHAKING`，保留任务位；返回进入前的阶段。
    pub(crate) fn enter_handshake(&self) -> HandshakePhase {
        let prev = self
            .raw
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(HANDSHAKING | (current & RUNNING_TASKS))
            })
            .unwrap_or_else(|current| current);
        decode(prev)
    }

    pub(crate) fn try_claim_tasks(&self) -> bool {
        self.raw.fetch_or(RUNNING_TASKS, Ordering::AcqRel) & RUNNING_TASKS == 0
    }

    pub(crate) fn release_tasks(&self) {
        self.raw.fetch_and(!RUNNING_TASKS, Ordering::AcqRel);
    }

    /// 从 `HANDSHAKING` 或 `INIT` 进入 `NOT_HANDSHAKING`，返回之前的阶段；
    /// 已经处于 `NOT_HANDSHAKING` 时返回 `None`。
    pub(crate) fn try_finish(&self) -> Option<HandshakePhase> {
        self.raw
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match current & PHASE_MASK {
                    NOT_HANDSHAKING => None,
                    _ => Some(NOT_HANDSHAKING | (current & RUNNING_TASKS)),
                }
            })
            .ok()
            .map(decode)
    }

    pub(crate) fn phase(&self) -> HandshakePhase {
        decode(self.raw.load(Ordering::Acquire))
    }

    pub(crate) fn snapshot(&self) -> HandshakeSnapshot {
        let raw = self.raw.load(Ordering::Acquire);
        HandshakeSnapshot {
            phase: decode(raw),
            running_tasks: raw & RUNNING_TASKS != 0,
        }
    }
}

impl Shared {
    /// 处理一次握手中的引擎结果，返回调用方是否应继续本轮处理。
    ///
    /// # 契约说明（What）
    /// - `NEED_TASK`：认领成功者把任务派发到执行器，双方都停止本轮；
    /// - `NEED_WRAP`：Reader 触发 Writer 后停止；Writer 继续；
    /// - `NEED_UNWRAP(_AGAIN)`：Writer 唤醒 Reader 后停止；Reader 继续；
    /// - 其它状态到达这里属于内部不变量被破坏。
    pub(super) fn do_handshake(
        &self,
        status: HandshakeStatus,
        side: Side,
    ) -> Result<bool, FlowError> {
        let prev = self.handshake.enter_handshake();
        if prev != HandshakePhase::Handshaking {
            debug!(flow = %self.name, side = side.label(), ?status, "handshake started");
        }
        trace!(flow = %self.name, side = side.label(), ?status, "handshake step");
        match status {
            HandshakeStatus::NeedTask => {
                if !self.handshake.try_claim_tasks() {
                    trace!(flow = %self.name, side = side.label(), "delegated tasks already claimed");
                    return Ok(false);
                }
                let tasks = self.engine.drain_delegated_tasks();
                self.execute_tasks(tasks);
                Ok(false)
            }
            HandshakeStatus::NeedWrap => match side {
                Side::Reader => {
                    self.trigger_write();
                    Ok(false)
                }
                Side::Writer => Ok(true),
            },
            HandshakeStatus::NeedUnwrap | HandshakeStatus::NeedUnwrapAgain => match side {
                Side::Reader => Ok(true),
                Side::Writer => {
                    self.schedule_reader();
                    Ok(false)
                }
            },
            HandshakeStatus::NotHandshaking | HandshakeStatus::Finished => Err(
                FlowError::internal(format!("unexpected handshake status {status:?} in handshake step")),
            ),
        }
    }

    /// 在执行器上运行委托任务，引擎仍报告 `NEED_TASK` 时继续取任务。
    fn execute_tasks(&self, tasks: Vec<DelegatedTask>) {
        let weak = self.weak.clone();
        debug!(flow = %self.name, count = tasks.len(), "dispatching delegated tasks");
        self.executor.execute(Box::new(move || {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let outcome = shared.run_delegated_tasks(tasks);
            shared.handshake.release_tasks();
            match outcome {
                Ok(executed) => {
                    debug!(flow = %shared.name, executed, "delegated tasks finished");
                    if !shared.engine.handshake_status().is_handshaking() {
                        shared.try_set_alpn();
                    }
                    shared.resume_activity();
                }
                Err(err) => shared.handle_error(err),
            }
        }));
    }

    fn run_delegated_tasks(&self, mut tasks: Vec<DelegatedTask>) -> Result<usize, FlowError> {
        let mut executed = 0;
        loop {
            for task in tasks {
                match panic::catch_unwind(AssertUnwindSafe(task)) {
                    Ok(Ok(())) => executed += 1,
                    Ok(Err(err)) => return Err(err),
                    Err(payload) => {
                        let detail = payload
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_owned())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "non-string panic payload".to_owned());
                        return Err(FlowError::task(format!("delegated task panicked: {detail}")));
                    }
                }
            }
            if self.engine.handshake_status() != HandshakeStatus::NeedTask {
                return Ok(executed);
            }
            tasks = self.engine.drain_delegated_tasks();
            if tasks.is_empty() {
                return Err(FlowError::internal(
                    "engine reports NEED_TASK but has no delegated task",
                ));
            }
        }
    }

    /// 任务完成或握手结束后，同时恢复 Writer（经触发标记）与 Reader。
    pub(super) fn resume_activity(&self) {
        self.trigger_write();
        self.schedule_reader();
    }

    /// 握手离开 `HANDSHAKING`/`INIT` 时锁定 ALPN；从 `HANDSHAKING` 结束时恢复双方。
    pub(super) fn try_set_alpn(&self) {
        if let Some(prev) = self.handshake.try_finish() {
            let protocol = self.engine.application_protocol();
            debug!(flow = %self.name, from = ?prev, alpn = ?protocol, "handshake finished");
            self.alpn.complete(protocol);
            if prev == HandshakePhase::Handshaking {
                self.resume_activity();
            }
        }
    }

    /// Reader 正常结束时调用：握手已经完成才锁定 ALPN，否则留给停止流程报告失败。
    pub(super) fn set_alpn_on_completion(&self) {
        if self.handshake.phase() == HandshakePhase::NotHandshaking {
            self.alpn.complete(self.engine.application_protocol());
        }
    }
}
