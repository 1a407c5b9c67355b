//! 脚本化的 [`TlsEngine`] 替身。
//!
//! # 设计定位（Why）
//! - 流委托的握手编排、背压与关闭逻辑需要可精确控制的引擎行为（何时缺数据、何时要委托任务、
//!   何时关闭），真实 TLS 实现无法稳定复现这些时序；
//! - [`ToyEngine`] 使用 TLS 风格的记录格式，足以覆盖分片、拼接与握手交替。
//!
//! # 记录格式（What）
//! ```text
//! +------+-------------+---------------------------+----------------+
//! | type | len (u32BE) | payload ^ 0x5A            | tag × tag_len  |
//! +------+-------------+---------------------------+----------------+
//! ```
//! - `type`：22 握手、23 应用数据、21 close_notify；
//! - `len` 为掩码负载与校验尾的总长度；
//! - 校验尾的每个字节都等于负载字节和（wrapping）异或 `0xA5`，不匹配即协议错误。

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use spark_flow::FlowError;

use crate::engine::{DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, TlsEngine};

pub const RECORD_HANDSHAKE: u8 = 22;
pub const RECORD_APPLICATION: u8 = 23;
pub const RECORD_ALERT: u8 = 21;
const HEADER_LEN: usize = 5;
pub const DEFAULT_TAG_LEN: usize = 16;
const DEFAULT_MAX_RECORD: usize = 16 * 1024;

const MASK: u8 = 0x5A;
const CLIENT_HELLO: &[u8] = b"client-hello";
const SERVER_HELLO: &[u8] = b"server-hello";
const CLOSE_NOTIFY: &[u8] = b"close-notify";

/// 委托任务的执行结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskBehavior {
    Succeed,
    Fail,
    Panic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    ClientStart,
    ClientAwaitServer,
    ClientAwaitTask,
    ServerAwaitClient,
    ServerAwaitTask,
    ServerSendHello,
    Established,
}

struct ToyState {
    phase: Phase,
    task_taken: bool,
    closing: bool,
    inbound_done: bool,
    outbound_done: bool,
}

impl ToyState {
    fn handshake_status(&self) -> HandshakeStatus {
        if self.closing && !self.outbound_done {
            return HandshakeStatus::NeedWrap;
        }
        match self.phase {
            Phase::ClientStart | Phase::ServerSendHello => HandshakeStatus::NeedWrap,
            Phase::ClientAwaitServer | Phase::ServerAwaitClient => HandshakeStatus::NeedUnwrap,
            Phase::ClientAwaitTask | Phase::ServerAwaitTask => HandshakeStatus::NeedTask,
            Phase::Established => HandshakeStatus::NotHandshaking,
        }
    }
}

/// 记录化、带脚本握手的引擎替身。
///
/// # 行为描述（How）
/// - 客户端：先 `wrap` 出 client-hello，随后等待 server-hello；
/// - 服务端：收到 client-hello 后 `wrap` 出 server-hello，握手结束；
/// - 配置了委托任务时，收到对方 hello 的一端先报告 `NEED_TASK`，任务执行后才继续；
/// - `close_outbound` 或收到对端 close_notify 后，下一次 `wrap` 产出 close_notify 记录并关闭出站方向。
///
/// # 契约定义（What）
/// - `dst` 剩余容量不足一条记录时报告 `BUFFER_OVERFLOW` 且不消费输入；
/// - 任意一条记录不完整时报告 `BUFFER_UNDERFLOW`；
/// - 握手完成前收到应用数据视为协议错误。
pub struct ToyEngine {
    state: Arc<Mutex<ToyState>>,
    tag_len: usize,
    alpn: Option<String>,
    task: Option<(TaskBehavior, Arc<AtomicUsize>)>,
}

impl ToyEngine {
    pub fn client() -> Self {
        Self::with_phase(Phase::ClientStart)
    }

    pub fn server() -> Self {
        Self::with_phase(Phase::ServerAwaitClient)
    }

    /// 没有握手阶段、直接收发应用记录的引擎。
    pub fn established() -> Self {
        Self::with_phase(Phase::Established)
    }

    fn with_phase(phase: Phase) -> Self {
        Self {
            state: Arc::new(Mutex::new(ToyState {
                phase,
                task_taken: false,
                closing: false,
                inbound_done: false,
                outbound_done: false,
            })),
            tag_len: DEFAULT_TAG_LEN,
            alpn: None,
            task: None,
        }
    }

    pub fn with_tag_len(mut self, tag_len: usize) -> Self {
        self.tag_len = tag_len;
        self
    }

    pub fn with_alpn(mut self, protocol: impl Into<String>) -> Self {
        self.alpn = Some(protocol.into());
        self
    }

    /// 收到对端 hello 时要求执行一个委托任务；`counter` 记录任务执行次数。
    pub fn with_delegated_task(mut self, behavior: TaskBehavior, counter: Arc<AtomicUsize>) -> Self {
        self.task = Some((behavior, counter));
        self
    }

    /// 按记录格式封装一条应用数据记录。
    pub fn seal(payload: &[u8], tag_len: usize) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len() + tag_len);
        encode_record(&mut out, RECORD_APPLICATION, payload, tag_len);
        out.freeze()
    }

    /// 解析连续的记录流，返回应用数据负载的拼接以及出现过的记录类型；
    /// 末尾不完整的记录被忽略。
    pub fn open_stream(stream: &[u8], tag_len: usize) -> Result<(Vec<u8>, Vec<u8>), FlowError> {
        let mut payload = Vec::new();
        let mut types = Vec::new();
        let mut rest = stream;
        while let Some((kind, body, total)) = split_record(rest) {
            let plain = open_body(body, tag_len)?;
            if kind == RECORD_APPLICATION {
                payload.extend_from_slice(&plain);
            }
            types.push(kind);
            rest = &rest[total..];
        }
        Ok((payload, types))
    }

    fn handshake_result(&self, state: &ToyState, consumed: usize, produced: usize) -> EngineResult {
        EngineResult::new(
            EngineStatus::Ok,
            state.handshake_status(),
            consumed,
            produced,
        )
    }

    fn record_len(&self, payload: usize) -> usize {
        HEADER_LEN + payload + self.tag_len
    }

    fn after_peer_hello(&self, state: &mut ToyState, task_phase: Phase, next: Phase) {
        if self.task.is_some() {
            state.phase = task_phase;
            state.task_taken = false;
        } else {
            state.phase = next;
        }
    }
}

impl TlsEngine for ToyEngine {
    fn wrap(&self, src: &[Bytes], dst: &mut BytesMut) -> Result<EngineResult, FlowError> {
        let mut state = self.state.lock();
        if state.outbound_done {
            return Ok(EngineResult::new(
                EngineStatus::Closed,
                state.handshake_status(),
                0,
                0,
            ));
        }
        let spare = dst.capacity() - dst.len();
        if state.closing {
            if spare < self.record_len(CLOSE_NOTIFY.len()) {
                return Ok(overflow(&state));
            }
            let produced = encode_record(dst, RECORD_ALERT, CLOSE_NOTIFY, self.tag_len);
            state.outbound_done = true;
            state.closing = false;
            return Ok(EngineResult::new(
                EngineStatus::Closed,
                state.handshake_status(),
                0,
                produced,
            ));
        }
        let hello = match state.phase {
            Phase::ClientStart => Some((CLIENT_HELLO, Phase::ClientAwaitServer)),
            Phase::ServerSendHello => Some((SERVER_HELLO, Phase::Established)),
            _ => None,
        };
        if let Some((message, next)) = hello {
            if spare < self.record_len(message.len()) {
                return Ok(overflow(&state));
            }
            let produced = encode_record(dst, RECORD_HANDSHAKE, message, self.tag_len);
            state.phase = next;
            let status = if next == Phase::Established {
                HandshakeStatus::Finished
            } else {
                state.handshake_status()
            };
            return Ok(EngineResult::new(EngineStatus::Ok, status, 0, produced));
        }
        if state.phase != Phase::Established {
            return Ok(self.handshake_result(&state, 0, 0));
        }
        let total = spark_flow::remaining(src);
        if total == 0 {
            return Ok(self.handshake_result(&state, 0, 0));
        }
        let take = total.min(DEFAULT_MAX_RECORD);
        if spare < self.record_len(take) {
            return Ok(overflow(&state));
        }
        let mut payload = Vec::with_capacity(take);
        for chunk in src {
            let need = take - payload.len();
            if need == 0 {
                break;
            }
            payload.extend_from_slice(&chunk[..need.min(chunk.len())]);
        }
        let produced = encode_record(dst, RECORD_APPLICATION, &payload, self.tag_len);
        Ok(self.handshake_result(&state, take, produced))
    }

    fn unwrap(&self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, FlowError> {
        let mut state = self.state.lock();
        if state.inbound_done {
            return Ok(EngineResult::new(
                EngineStatus::Closed,
                state.handshake_status(),
                0,
                0,
            ));
        }
        let Some((kind, body, total)) = split_record(src) else {
            return Ok(EngineResult::new(
                EngineStatus::BufferUnderflow,
                state.handshake_status(),
                0,
                0,
            ));
        };
        let payload = open_body(body, self.tag_len)?;
        match kind {
            RECORD_HANDSHAKE => {
                match (state.phase, payload.as_slice()) {
                    (Phase::ServerAwaitClient, CLIENT_HELLO) => {
                        self.after_peer_hello(&mut state, Phase::ServerAwaitTask, Phase::ServerSendHello);
                        Ok(self.handshake_result(&state, total, 0))
                    }
                    (Phase::ClientAwaitServer, SERVER_HELLO) => {
                        self.after_peer_hello(&mut state, Phase::ClientAwaitTask, Phase::Established);
                        let status = if state.phase == Phase::Established {
                            HandshakeStatus::Finished
                        } else {
                            state.handshake_status()
                        };
                        Ok(EngineResult::new(EngineStatus::Ok, status, total, 0))
                    }
                    (phase, _) => Err(FlowError::protocol(format!(
                        "unexpected handshake message in phase {phase:?}"
                    ))),
                }
            }
            RECORD_APPLICATION => {
                if state.phase != Phase::Established {
                    return Err(FlowError::protocol("application data before handshake"));
                }
                if dst.capacity() - dst.len() < payload.len() {
                    return Ok(overflow(&state));
                }
                dst.extend_from_slice(&payload);
                Ok(self.handshake_result(&state, total, payload.len()))
            }
            RECORD_ALERT => {
                state.inbound_done = true;
                if !state.outbound_done {
                    state.closing = true;
                }
                Ok(EngineResult::new(
                    EngineStatus::Closed,
                    state.handshake_status(),
                    total,
                    0,
                ))
            }
            other => Err(FlowError::protocol(format!("unknown record type {other}"))),
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.state.lock().handshake_status()
    }

    fn drain_delegated_tasks(&self) -> Vec<DelegatedTask> {
        let mut state = self.state.lock();
        let next = match state.phase {
            Phase::ServerAwaitTask => Phase::ServerSendHello,
            Phase::ClientAwaitTask => Phase::Established,
            _ => return Vec::new(),
        };
        let Some((behavior, counter)) = self.task.clone() else {
            return Vec::new();
        };
        if state.task_taken {
            return Vec::new();
        }
        state.task_taken = true;
        let shared = Arc::clone(&self.state);
        vec![Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            match behavior {
                TaskBehavior::Succeed => {
                    shared.lock().phase = next;
                    Ok(())
                }
                TaskBehavior::Fail => Err(FlowError::task("certificate rejected by toy verifier")),
                TaskBehavior::Panic => panic!("toy delegated task exploded"),
            }
        })]
    }

    fn is_inbound_done(&self) -> bool {
        self.state.lock().inbound_done
    }

    fn is_outbound_done(&self) -> bool {
        self.state.lock().outbound_done
    }

    fn application_protocol(&self) -> Option<String> {
        if self.state.lock().phase == Phase::Established {
            self.alpn.clone()
        } else {
            None
        }
    }

    fn application_buffer_size(&self) -> usize {
        DEFAULT_MAX_RECORD
    }

    fn packet_buffer_size(&self) -> usize {
        self.record_len(DEFAULT_MAX_RECORD)
    }

    fn close_outbound(&self) {
        let mut state = self.state.lock();
        if !state.outbound_done {
            state.closing = true;
        }
    }
}

/// 不做任何变换的引擎：每次 `wrap` 原样输出第一个字节块，`unwrap` 原样输出全部输入。
#[derive(Default)]
pub struct PassthroughEngine {
    outbound_done: Mutex<bool>,
}

impl PassthroughEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TlsEngine for PassthroughEngine {
    fn wrap(&self, src: &[Bytes], dst: &mut BytesMut) -> Result<EngineResult, FlowError> {
        if *self.outbound_done.lock() {
            return Ok(EngineResult::new(
                EngineStatus::Closed,
                HandshakeStatus::NotHandshaking,
                0,
                0,
            ));
        }
        let Some(first) = src.iter().find(|chunk| !chunk.is_empty()) else {
            return Ok(EngineResult::new(
                EngineStatus::Ok,
                HandshakeStatus::NotHandshaking,
                0,
                0,
            ));
        };
        dst.extend_from_slice(first);
        Ok(EngineResult::new(
            EngineStatus::Ok,
            HandshakeStatus::NotHandshaking,
            first.len(),
            first.len(),
        ))
    }

    fn unwrap(&self, src: &[u8], dst: &mut BytesMut) -> Result<EngineResult, FlowError> {
        dst.extend_from_slice(src);
        Ok(EngineResult::new(
            EngineStatus::Ok,
            HandshakeStatus::NotHandshaking,
            src.len(),
            src.len(),
        ))
    }

    fn handshake_status(&self) -> HandshakeStatus {
        HandshakeStatus::NotHandshaking
    }

    fn drain_delegated_tasks(&self) -> Vec<DelegatedTask> {
        Vec::new()
    }

    fn is_inbound_done(&self) -> bool {
        false
    }

    fn is_outbound_done(&self) -> bool {
        *self.outbound_done.lock()
    }

    fn application_protocol(&self) -> Option<String> {
        None
    }

    fn application_buffer_size(&self) -> usize {
        DEFAULT_MAX_RECORD
    }

    fn packet_buffer_size(&self) -> usize {
        DEFAULT_MAX_RECORD
    }

    fn close_outbound(&self) {
        *self.outbound_done.lock() = true;
    }
}

fn overflow(state: &ToyState) -> EngineResult {
    EngineResult::new(
        EngineStatus::BufferOverflow,
        state.handshake_status(),
        0,
        0,
    )
}

fn tag_byte(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) ^ 0xA5
}

fn encode_record(dst: &mut BytesMut, kind: u8, payload: &[u8], tag_len: usize) -> usize {
    let body_len = payload.len() + tag_len;
    let start = dst.len();
    dst.put_u8(kind);
    dst.put_u32(body_len as u32);
    dst.extend(payload.iter().map(|b| b ^ MASK));
    dst.put_bytes(tag_byte(payload), tag_len);
    dst.len() - start
}

/// 切出第一条完整记录：`(type, body, 记录总长)`。
fn split_record(src: &[u8]) -> Option<(u8, &[u8], usize)> {
    if src.len() < HEADER_LEN {
        return None;
    }
    let body_len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
    let total = HEADER_LEN + body_len;
    if src.len() < total {
        return None;
    }
    Some((src[0], &src[HEADER_LEN..total], total))
}

fn open_body(body: &[u8], tag_len: usize) -> Result<Vec<u8>, FlowError> {
    if body.len() < tag_len {
        return Err(FlowError::protocol("record shorter than its tag"));
    }
    let (masked, tag) = body.split_at(body.len() - tag_len);
    let payload: Vec<u8> = masked.iter().map(|b| b ^ MASK).collect();
    let expected = tag_byte(&payload);
    if tag.iter().any(|b| *b != expected) {
        return Err(FlowError::protocol("record authentication failed"));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_record_has_header_payload_and_tag() {
        let record = ToyEngine::seal(b"hello-world", 34);
        assert_eq!(record.len(), 50, "5 字节头 + 11 字节负载 + 34 字节校验尾");
        let engine = ToyEngine::established().with_tag_len(34);
        let mut dst = BytesMut::with_capacity(64);
        let underflow = engine.unwrap(&record[..10], &mut dst).expect("不完整记录不是错误");
        assert_eq!(underflow.status, EngineStatus::BufferUnderflow);
        let result = engine.unwrap(&record, &mut dst).expect("完整记录应解密");
        assert_eq!(result.bytes_consumed, 50);
        assert_eq!(&dst[..], b"hello-world");
    }

    #[test]
    fn tampered_record_is_rejected() {
        let mut record = BytesMut::from(&ToyEngine::seal(b"abc", 4)[..]);
        let last = record.len() - 1;
        record[last] ^= 0xFF;
        let engine = ToyEngine::established().with_tag_len(4);
        let err = engine
            .unwrap(&record, &mut BytesMut::with_capacity(16))
            .expect_err("篡改的记录必须被拒绝");
        assert_eq!(err.kind(), "tls.protocol");
    }

    #[test]
    fn scripted_handshake_reaches_established() {
        let client = ToyEngine::client().with_alpn("h2");
        let server = ToyEngine::server().with_alpn("h2");
        let mut wire = BytesMut::with_capacity(256);
        client.wrap(&[], &mut wire).expect("client-hello");
        assert_eq!(client.handshake_status(), HandshakeStatus::NeedUnwrap);
        server.unwrap(&wire, &mut BytesMut::new()).expect("服务端接收 client-hello");
        assert_eq!(server.handshake_status(), HandshakeStatus::NeedWrap);

        let mut reply = BytesMut::with_capacity(256);
        let result = server.wrap(&[], &mut reply).expect("server-hello");
        assert_eq!(result.handshake_status, HandshakeStatus::Finished);
        client.unwrap(&reply, &mut BytesMut::new()).expect("客户端接收 server-hello");
        assert_eq!(client.application_protocol().as_deref(), Some("h2"));
    }
}
