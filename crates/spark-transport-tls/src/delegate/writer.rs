//! 加密方向。
//!
//! Writer 把明文追加到待加密列表，按顺序 `wrap` 并把密文交给传输层。
//! 握手期间没有应用数据时通过触发标记强制执行空 `wrap`；
//! 上游结束后（可选地）先发送 close_notify 再结束下游。

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use parking_lot::Mutex;
use spark_flow::{ByteChunks, FlowError, SequentialScheduler};
use tracing::{debug, trace, warn};

use super::{MAX_OVERFLOW_RETRIES, Shared, Side, pending::PendingWriteList, stage::Stage};
use crate::engine::{EngineResult, EngineStatus, HandshakeStatus};

pub(crate) struct Writer {
    pub(crate) stage: Stage,
    pub(crate) pending: Mutex<PendingWriteList>,
    pub(crate) scheduler: Arc<SequentialScheduler>,
    pub(crate) completed: AtomicBool,
    close_requested: AtomicBool,
}

impl Writer {
    pub(crate) fn new(name: &str, weak: Weak<Shared>) -> Self {
        let scheduler = {
            let weak = weak.clone();
            SequentialScheduler::new(format!("{name}-writer"), move || {
                if let Some(shared) = weak.upgrade() {
                    shared.process_writer();
                }
            })
        };
        Self {
            stage: Stage::new(Side::Writer, name, weak),
            pending: Mutex::new(PendingWriteList::default()),
            scheduler,
            completed: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
        }
    }
}

impl Shared {
    /// 追加明文或完成标记并调度加密；完成标记之后到达的数据被丢弃。
    pub(super) fn writer_incoming(&self, chunks: ByteChunks, complete: bool) {
        let mut discarded = Vec::new();
        {
            let mut pending = self.writer.pending.lock();
            for chunk in chunks {
                if !pending.push_data(chunk.clone()) {
                    discarded.push(chunk);
                }
            }
            if complete {
                pending.mark_completion();
            }
        }
        if !discarded.is_empty() {
            warn!(
                flow = %self.name,
                bytes = spark_flow::remaining(&discarded),
                "plaintext arrived after upstream completion, discarded"
            );
            self.recycle(discarded);
        }
        self.writer.scheduler.run_or_schedule();
    }

    /// 插入触发标记（列表为空时）并调度 Writer。
    pub(super) fn trigger_write(&self) {
        if self.writer.pending.lock().push_trigger_if_empty() {
            trace!(flow = %self.name, "handshake trigger queued");
        }
        self.writer.scheduler.run_or_schedule();
    }

    pub(super) fn process_writer(&self) {
        if self.is_stopped() || self.writer.completed.load(Ordering::Acquire) {
            return;
        }
        match self.wrap_loop() {
            Ok(()) => self.upstream_window_update(Side::Writer),
            Err(err) => self.handle_error(err),
        }
    }

    /// Writer 的窗口策略：待加密数据块超过高水位时不再请求。
    pub(super) fn writer_window_update(&self, window: u64, queued: usize) -> u64 {
        if self.writer.pending.lock().data_chunks() > self.config.writer_high_water_mark {
            return 0;
        }
        self.default_window_update(window, queued)
    }

    fn wrap_loop(&self) -> Result<(), FlowError> {
        loop {
            if self.is_stopped() {
                return Ok(());
            }
            let (data, has_trigger, completing) = {
                let pending = self.writer.pending.lock();
                (
                    pending.data_snapshot(),
                    pending.has_trigger(),
                    pending.is_completing(),
                )
            };
            let status = self.engine.handshake_status();
            if data.is_empty() && !has_trigger && status != HandshakeStatus::NeedWrap {
                if completing && !status.is_handshaking() {
                    return self.close_writer();
                }
                return Ok(());
            }
            let result = self.wrap_front(&data)?;
            self.writer.pending.lock().consume(result.bytes_consumed);
            trace!(flow = %self.name, ?result, "wrap");

            if result.status == EngineStatus::Closed {
                self.outbound_closed(&result);
                if result.bytes_produced == 0 {
                    return self.finish_writer();
                }
                continue;
            }
            let progressed = result.bytes_consumed > 0 || result.bytes_produced > 0;
            if result.handshaking() {
                if !self.do_handshake(result.handshake_status, Side::Writer)? {
                    return Ok(());
                }
                let needs_wrap = self.engine.handshake_status() == HandshakeStatus::NeedWrap;
                if !needs_wrap || !progressed {
                    return Ok(());
                }
                let mut pending = self.writer.pending.lock();
                if pending.data_remaining() == 0 {
                    pending.push_trigger();
                }
                continue;
            }
            self.try_set_alpn();
            if !progressed && !has_trigger {
                // 引擎没有任何进展，等待握手或下一次调度。
                return Ok(());
            }
        }
    }

    /// 加密 `data`，产出的密文立即进入输出队列。
    fn wrap_front(&self, data: &[Bytes]) -> Result<EngineResult, FlowError> {
        let mut dst = self.pool.acquire(self.engine.packet_buffer_size());
        let mut attempts = 0;
        let result = loop {
            let result = self.engine.wrap(data, &mut dst)?;
            if result.status != EngineStatus::BufferOverflow {
                break result;
            }
            attempts += 1;
            if attempts > MAX_OVERFLOW_RETRIES {
                return Err(FlowError::internal(
                    "engine keeps reporting BUFFER_OVERFLOW on wrap",
                ));
            }
            dst.reserve(self.engine.packet_buffer_size());
        };
        self.forward_or_release(Side::Writer, dst, result.bytes_produced);
        Ok(result)
    }

    /// 出站方向已关闭：停止接收明文并把剩余数据标记为完成。
    fn outbound_closed(&self, result: &EngineResult) {
        let stage = &self.writer.stage;
        if !stage.upstream_completed.swap(true, Ordering::AcqRel) {
            debug!(flow = %self.name, "outbound closed, cancelling plaintext upstream");
            stage.cancel_upstream();
        }
        if result.bytes_produced > 0 {
            let mut pending = self.writer.pending.lock();
            pending.clear();
            pending.mark_completion();
        }
    }

    /// 上游结束且没有待加密数据：按配置发送 close_notify 后结束下游。
    fn close_writer(&self) -> Result<(), FlowError> {
        if !self.config.close_notify_on_complete || self.engine.is_outbound_done() {
            return self.finish_writer();
        }
        if !self.writer.close_requested.swap(true, Ordering::AcqRel) {
            debug!(flow = %self.name, "sending close_notify");
            self.engine.close_outbound();
        }
        let mut attempts = 0;
        while !self.engine.is_outbound_done() {
            let result = self.wrap_front(&[])?;
            if result.bytes_produced == 0 {
                break;
            }
            attempts += 1;
            if attempts > MAX_OVERFLOW_RETRIES {
                return Err(FlowError::internal(
                    "engine keeps producing output after close_outbound",
                ));
            }
        }
        self.finish_writer()
    }

    /// 结束写方向，仅一次。
    fn finish_writer(&self) -> Result<(), FlowError> {
        if self.writer.completed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(flow = %self.name, "writer finished");
        self.writer.pending.lock().clear();
        self.writer.stage.outgoing(Vec::new(), true);
        Ok(())
    }
}
