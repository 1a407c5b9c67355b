//! `spark-flow` 定义背压流的最小契约与并发原语。
//!
//! # 模块定位（Why）
//! - TLS 流封装、内存传输与测试替身都依赖同一组 `Publisher`/`Subscriber`/`Subscription`
//!   语义，将其抽离为独立 crate 可以避免传输层与协议层互相引用；
//! - 背压计数（[`Demand`]）、单飞调度（[`SequentialScheduler`]）、一次性完成信号
//!   （[`Completion`]）是双向流水线反复出现的组合件，集中实现便于统一审查原子序。
//!
//! # 设计概要（How）
//! - `contract`：对象安全的订阅契约，所有信号通过 `Arc<dyn ...>` 传递；
//! - `demand`：基于 `AtomicU64` 的饱和计数器；
//! - `scheduler`：`idle/running/again/stopped` 四态单飞循环；
//! - `executor`：任务执行设施抽象，提供内联、线程与 Tokio 三种实现；
//! - `completion`：首个结果胜出的完成信号，支持回调、异步等待与阻塞等待；
//! - `error`：统一的 [`FlowError`] 分类。
//!
//! # 契约说明（What）
//! - 所有公开类型均满足 `Send + Sync + 'static`，可在任意线程之间传递；
//! - 库代码不 `panic`，违反不变量时返回 [`FlowError::Internal`]。

mod completion;
mod contract;
mod demand;
mod error;
mod executor;
mod scheduler;

pub use completion::{Completion, Wait};
pub use contract::{ByteChunks, FlowTube, Publisher, Subscriber, Subscription, remaining};
pub use demand::Demand;
pub use error::FlowError;
#[cfg(feature = "runtime-tokio")]
pub use executor::TokioExecutor;
pub use executor::{Executor, InlineExecutor, Task, ThreadExecutor};
pub use scheduler::SequentialScheduler;
