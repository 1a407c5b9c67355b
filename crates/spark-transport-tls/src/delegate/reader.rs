//! 解密方向。
//!
//! Reader 把传输层送来的密文追加到 [`ReadBuffer`]，反复 `unwrap` 直到数据不足，
//! 解出的明文立即交给下游；握手结果交给协调逻辑处理。

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use parking_lot::Mutex;
use spark_flow::{ByteChunks, FlowError, SequentialScheduler};
use tracing::{debug, trace};

use super::{MAX_OVERFLOW_RETRIES, Shared, Side, read_buffer::ReadBuffer, stage::Stage};
use crate::engine::{EngineResult, EngineStatus, HandshakeStatus};

pub(crate) struct Reader {
    pub(crate) stage: Stage,
    pub(crate) buffer: Mutex<ReadBuffer>,
    /// 上次 `BUFFER_UNDERFLOW` 时的未读长度；未读数据不超过它时无需再次尝试。
    min_bytes_required: AtomicUsize,
    pub(crate) completing: AtomicBool,
    pub(crate) completed: AtomicBool,
    pub(crate) scheduler: Arc<SequentialScheduler>,
}

impl Reader {
    pub(crate) fn new(name: &str, initial_capacity: usize, weak: Weak<Shared>) -> Self {
        let scheduler = {
            let weak = weak.clone();
            SequentialScheduler::new(format!("{name}-reader"), move || {
                if let Some(shared) = weak.upgrade() {
                    shared.process_reader();
                }
            })
        };
        Self {
            stage: Stage::new(Side::Reader, name, weak),
            buffer: Mutex::new(ReadBuffer::with_capacity(initial_capacity)),
            min_bytes_required: AtomicUsize::new(0),
            completing: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            scheduler,
        }
    }
}

/// 单轮处理的去向。
enum Flow {
    Continue,
    Suspend,
}

impl Shared {
    /// 追加密文并调度处理；可以独占的分片在拷贝后归还缓冲池。
    pub(super) fn reader_incoming(&self, chunks: ByteChunks, complete: bool) {
        {
            let mut buffer = self.reader.buffer.lock();
            for chunk in chunks {
                buffer.append(&chunk);
                if let Ok(owned) = chunk.try_into_mut() {
                    self.pool.release(owned);
                }
            }
        }
        if complete {
            self.reader.completing.store(true, Ordering::Release);
        }
        self.reader.scheduler.run_or_schedule();
    }

    pub(super) fn schedule_reader(&self) {
        self.reader.scheduler.run_or_schedule();
    }

    pub(super) fn process_reader(&self) {
        if self.is_stopped() || self.reader.completed.load(Ordering::Acquire) {
            return;
        }
        match self.unwrap_loop() {
            Ok(()) => self.upstream_window_update(Side::Reader),
            Err(err) => self.handle_error(err),
        }
    }

    /// Reader 的窗口策略：未读密文达到目标值或下游积压时不再请求。
    pub(super) fn reader_window_update(&self, window: u64, queued: usize) -> u64 {
        if self.reader.buffer.lock().len() >= self.config.reader_target_buffered {
            return 0;
        }
        self.default_window_update(window, queued)
    }

    fn unwrap_loop(&self) -> Result<(), FlowError> {
        loop {
            let complete = self.reader.completing.load(Ordering::Acquire);
            let len = self.reader.buffer.lock().len();
            if len == 0 {
                if complete {
                    self.finish_reader();
                }
                return Ok(());
            }
            let min = self.reader.min_bytes_required.load(Ordering::Acquire);
            if len <= min {
                if complete {
                    return Err(self.trailing_bytes(len));
                }
                self.request_more();
                return Ok(());
            }
            let result = self.unwrap_front()?;
            match self.after_unwrap(result, len, complete)? {
                Flow::Continue => continue,
                Flow::Suspend => return Ok(()),
            }
        }
    }

    fn after_unwrap(
        &self,
        result: EngineResult,
        len: usize,
        complete: bool,
    ) -> Result<Flow, FlowError> {
        trace!(flow = %self.name, ?result, "unwrap");
        match result.status {
            EngineStatus::BufferUnderflow => {
                if self.reader.buffer.lock().len() > len {
                    return Ok(Flow::Continue);
                }
                self.reader.min_bytes_required.store(len, Ordering::Release);
                if complete {
                    return Err(self.trailing_bytes(len));
                }
                self.request_more();
                return Ok(Flow::Suspend);
            }
            EngineStatus::Closed => {
                self.do_closure(&result);
                if complete {
                    self.finish_reader();
                    return Ok(Flow::Suspend);
                }
                if result.bytes_consumed == 0 {
                    return Ok(Flow::Suspend);
                }
            }
            EngineStatus::Ok | EngineStatus::BufferOverflow => {}
        }
        if result.bytes_consumed > 0 {
            self.reader.min_bytes_required.store(0, Ordering::Release);
        }
        if result.handshaking() {
            if !self.do_handshake(result.handshake_status, Side::Reader)? {
                return Ok(Flow::Suspend);
            }
        } else {
            self.try_set_alpn();
        }
        if result.bytes_consumed == 0 && result.bytes_produced == 0 {
            // 没有任何进展：等待更多密文。
            self.reader.min_bytes_required.store(len, Ordering::Release);
            self.request_more();
            return Ok(Flow::Suspend);
        }
        Ok(Flow::Continue)
    }

    /// 解密缓冲前部，产出的明文立即进入输出队列。
    fn unwrap_front(&self) -> Result<EngineResult, FlowError> {
        let mut dst = self.pool.acquire(self.engine.application_buffer_size());
        let mut attempts = 0;
        let result = loop {
            let result = {
                let mut buffer = self.reader.buffer.lock();
                let result = self.engine.unwrap(buffer.unread(), &mut dst)?;
                buffer.consume(result.bytes_consumed);
                result
            };
            if result.status != EngineStatus::BufferOverflow {
                break result;
            }
            attempts += 1;
            if attempts > MAX_OVERFLOW_RETRIES {
                return Err(FlowError::internal(
                    "engine keeps reporting BUFFER_OVERFLOW on unwrap",
                ));
            }
            dst.reserve(self.engine.application_buffer_size());
        };
        self.forward_or_release(Side::Reader, dst, result.bytes_produced);
        Ok(result)
    }

    pub(super) fn forward_or_release(&self, side: Side, dst: BytesMut, produced: usize) {
        if produced > 0 && !dst.is_empty() {
            self.stage(side).outgoing(vec![dst.freeze()], false);
        } else {
            self.pool.release(dst);
        }
    }

    /// 数据不足时确保上游至少还有一个请求在途。
    fn request_more(&self) {
        let stage = &self.reader.stage;
        if stage.upstream_window.is_fulfilled() && !stage.upstream_completed.load(Ordering::Acquire)
        {
            self.upstream_request(Side::Reader, 1);
        }
    }

    /// 收到对端 close_notify：记录并在需要回复时触发 Writer。
    fn do_closure(&self, result: &EngineResult) {
        if result.status != EngineStatus::Closed || !self.engine.is_inbound_done() {
            return;
        }
        if !self.close_notify_received.swap(true, Ordering::AcqRel) {
            debug!(flow = %self.name, "close_notify received");
        }
        if !self.engine.is_outbound_done()
            && self.engine.handshake_status() == HandshakeStatus::NeedWrap
        {
            if self.writer.scheduler.is_stopped() || self.writer.completed.load(Ordering::Acquire) {
                self.reader.completing.store(true, Ordering::Release);
            } else {
                self.trigger_write();
            }
        }
    }

    /// 流在半条记录处结束；握手尚未完成时归类为握手中断。
    fn trailing_bytes(&self, len: usize) -> FlowError {
        self.check_for_handshake(FlowError::protocol(format!(
            "stream ended with {len} bytes that do not form a complete record"
        )))
    }

    /// 正常结束：锁定 ALPN，向下游请求结束，仅一次。
    fn finish_reader(&self) {
        if self.reader.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(flow = %self.name, "reader finished");
        self.set_alpn_on_completion();
        self.reader.buffer.lock().clear();
        self.reader.stage.outgoing(Vec::new(), true);
    }
}

