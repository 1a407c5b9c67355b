//! 流委托与 Tube 的测试替身集合。
//!
//! # 设计定位（Why）
//! - 单元测试、集成测试与下游 crate 的端到端验证都需要可控的引擎、传输与订阅者；
//!   在各测试文件中重复定义这些类型会让契约调整时漏改；
//! - 替身均遵守 [`spark_flow`] 的需求与信号次序契约，因此它们本身也是契约的参考实现。
//!
//! # 使用方式（How）
//! - `use spark_transport_tls::test_stubs::{ToyEngine, MemoryTransport, RecordingSubscriber};`
//! - [`ToyEngine`] 负责脚本化握手与记录格式，[`PassthroughEngine`] 用于只关心背压的场景；
//! - [`ManualExecutor`] 让委托任务的执行时机完全由测试决定。
//!
//! # 契约说明（What）
//! - **前置条件**：替身仅用于测试与示例，`ToyEngine` 不提供任何安全性；
//! - **后置条件**：替身不产生 I/O，所有状态都可以通过访问器观察。
//!
//! # 风险与权衡（Trade-offs）
//! - 模块无条件公开以便 `tests/` 目录复用，代价是它出现在公开 API 中。

mod engine;
mod executor;
mod recording;
mod transport;

pub use engine::{
    DEFAULT_TAG_LEN, PassthroughEngine, RECORD_ALERT, RECORD_APPLICATION, RECORD_HANDSHAKE,
    TaskBehavior, ToyEngine,
};
pub use executor::ManualExecutor;
pub use recording::{Event, RecordingSubscriber};
pub use transport::{MemoryTransport, QueuePublisher};
