#![doc = r#"
# spark-transport-tls

## 设计动机（Why）
- **流式加解密**：把 TLS 引擎包装进背压字节流，明文一侧与密文一侧都遵守
  [`spark_flow`] 的需求计数契约，任何一侧都不会被无界缓冲；
- **与传输同形**：[`TlsTube`] 对外仍是 [`FlowTube`](spark_flow::FlowTube)，
  可以出现在任何普通传输可以出现的位置；
- **可替换引擎**：[`TlsEngine`] 抽象记录层，生产使用 [`RustlsEngine`]，测试使用
  [`test_stubs`] 中的脚本化引擎。

## 核心契约（What）
- [`TlsFlowDelegate`]：Reader（解密）与 Writer（加密）两条流水线，外加共享的握手协调；
- [`TlsTube`]：在委托之上提供可替换的应用订阅者、写方向需求累积与握手中断检测；
- [`TlsFlowConfig`]：背压阈值与取消策略，可从 TOML 加载；
- 错误统一使用 [`FlowError`](spark_flow::FlowError)，首个错误终止整个连接。

## 实现策略（How）
- 每个方向由一个 [`SequentialScheduler`](spark_flow::SequentialScheduler) 驱动，
  同一方向的处理永不并发；
- 握手阶段与“任务运行中”标记打包在单个原子量中，委托任务只被认领一次；
- 日志使用 `tracing`，每条事件携带 `flow` 字段标识连接。

## 风险与考量（Trade-offs）
- 缓冲区来自注入的 [`BufferPool`](spark_buffer::BufferPool)，池的回收策略直接影响内存峰值；
- 引擎以 `&self` 调用并由实现方自行加锁，Reader 与 Writer 会在引擎锁上短暂竞争。
"#]

mod config;
mod delegate;
mod engine;
#[cfg(feature = "rustls")]
mod rustls_engine;
/// 测试替身命名空间：脚本化引擎、内存传输、记录型订阅者与手动执行器。
///
/// # 使用方式（How）
/// - 集成测试通过 `use spark_transport_tls::test_stubs::*;` 复用，
///   替身契约随核心类型一起演进。
pub mod test_stubs;
mod tube;

pub use config::{
    ConfigError, DEFAULT_DOWNSTREAM_QUEUE_LIMIT, DEFAULT_READER_INITIAL_CAPACITY,
    DEFAULT_READER_TARGET_BUFFERED, DEFAULT_WRITER_HIGH_WATER_MARK, TlsFlowConfig,
    WriteCancelPolicy,
};
pub use delegate::{HandshakePhase, HandshakeSnapshot, TlsFlowDelegate};
pub use engine::{DelegatedTask, EngineResult, EngineStatus, HandshakeStatus, TlsEngine};
#[cfg(feature = "rustls")]
pub use rustls_engine::RustlsEngine;
pub use tube::{TlsTube, TubePhase};
