//! 基于 rustls 的 [`TlsEngine`] 实现。
//!
//! # 模块角色（Why）
//! - rustls 以 `read_tls`/`process_new_packets`/`write_tls` 三段式驱动连接，
//!   本模块把它折叠为 `unwrap`/`wrap` 两个入口，使流委托不感知 rustls 的 I/O 模型；
//! - rustls 不产生委托任务，证书校验在 `process_new_packets` 内同步完成。
//!
//! # 状态映射（How）
//! - 连接有待发送记录（握手消息、会话票据、close_notify）时报告 `NEED_WRAP`；
//! - 握手中且无待发送记录时报告 `NEED_UNWRAP`；
//! - 收到对端 close_notify 后立即排队我方 close_notify，入站方向随之结束。

use std::{
    io::{Read, Write},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rustls::{
    ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection,
    pki_types::ServerName,
};
use spark_flow::FlowError;
use tracing::debug;

use crate::engine::{DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, TlsEngine};

/// 单条 TLS 记录的最大明文长度。
const MAX_FRAGMENT_LEN: usize = 16 * 1024;
/// 记录头、MAC 与填充的上限余量。
const RECORD_OVERHEAD: usize = 2048;

struct State {
    conn: Connection,
    close_sent: bool,
    inbound_done: bool,
    outbound_done: bool,
}

impl State {
    fn handshake_status(&self) -> HandshakeStatus {
        if self.conn.wants_write() && !self.outbound_done {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() && !self.inbound_done {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    /// 取出全部待发送记录。
    fn drain_tls(&mut self, dst: &mut BytesMut) -> Result<usize, FlowError> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            let written = self
                .conn
                .write_tls(&mut out)
                .map_err(|err| FlowError::protocol(format!("rustls write_tls failed: {err}")))?;
            if written == 0 {
                break;
            }
        }
        dst.extend_from_slice(&out);
        if self.close_sent && !self.conn.wants_write() {
            self.outbound_done = true;
        }
        Ok(out.len())
    }
}

/// rustls 连接适配器。
///
/// # 教案式说明
/// - **意图 (Why)**：生产环境直接复用 rustls 的协议实现，流委托只负责背压与握手编排。
/// - **契约 (What)**：
///   - 内部互斥锁串行化 Reader 与 Writer 对同一连接的访问；
///   - `unwrap` 总是消费全部输入（rustls 自行缓存不完整的记录），因此从不报告 `BUFFER_UNDERFLOW`；
///   - `dst` 按需增长，不会报告 `BUFFER_OVERFLOW`。
/// - **风险 (Trade-offs)**：`wrap` 先把密文写入临时向量再追加到 `dst`，多一次拷贝换取实现简单。
pub struct RustlsEngine {
    state: Mutex<State>,
}

impl RustlsEngine {
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, FlowError> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|err| FlowError::config(format!("cannot create client connection: {err}")))?;
        Ok(Self::from_connection(conn.into()))
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, FlowError> {
        let conn = ServerConnection::new(config)
            .map_err(|err| FlowError::config(format!("cannot create server connection: {err}")))?;
        Ok(Self::from_connection(conn.into()))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            state: Mutex::new(State {
                conn,
                close_sent: false,
                inbound_done: false,
                outbound_done: false,
            }),
        }
    }
}

impl TlsEngine for RustlsEngine {
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
        let mut consumed = 0;
        if !state.close_sent {
            for chunk in src {
                let written = state
                    .conn
                    .writer()
                    .write(chunk)
                    .map_err(|err| FlowError::protocol(format!("rustls rejected plaintext: {err}")))?;
                consumed += written;
                if written < chunk.len() {
                    break;
                }
            }
        }
        let produced = state.drain_tls(dst)?;
        let status = if state.outbound_done {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(
            status,
            state.handshake_status(),
            consumed,
            produced,
        ))
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
        let mut cursor = src;
        let consumed = state
            .conn
            .read_tls(&mut cursor)
            .map_err(|err| FlowError::protocol(format!("rustls read_tls failed: {err}")))?;
        let io = state
            .conn
            .process_new_packets()
            .map_err(|err| FlowError::protocol(err.to_string()))?;

        let available = io.plaintext_bytes_to_read();
        if available > 0 {
            let start = dst.len();
            dst.resize(start + available, 0);
            state
                .conn
                .reader()
                .read_exact(&mut dst[start..])
                .map_err(|err| FlowError::protocol(format!("rustls plaintext read failed: {err}")))?;
        }
        if io.peer_has_closed() && !state.inbound_done {
            state.inbound_done = true;
            if !state.close_sent {
                debug!("peer sent close_notify, queueing ours");
                state.conn.send_close_notify();
                state.close_sent = true;
            }
        }
        let status = if state.inbound_done {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(
            status,
            state.handshake_status(),
            consumed,
            available,
        ))
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.state.lock().handshake_status()
    }

    fn drain_delegated_tasks(&self) -> Vec<DelegatedTask> {
        Vec::new()
    }

    fn is_inbound_done(&self) -> bool {
        self.state.lock().inbound_done
    }

    fn is_outbound_done(&self) -> bool {
        self.state.lock().outbound_done
    }

    fn application_protocol(&self) -> Option<String> {
        let state = self.state.lock();
        if state.conn.is_handshaking() {
            return None;
        }
        state
            .conn
            .alpn_protocol()
            .map(|protocol| String::from_utf8_lossy(protocol).into_owned())
    }

    fn application_buffer_size(&self) -> usize {
        MAX_FRAGMENT_LEN
    }

    fn packet_buffer_size(&self) -> usize {
        MAX_FRAGMENT_LEN + RECORD_OVERHEAD
    }

    fn close_outbound(&self) {
        let mut state = self.state.lock();
        if !state.close_sent {
            state.conn.send_close_notify();
            state.close_sent = true;
        }
    }
}
