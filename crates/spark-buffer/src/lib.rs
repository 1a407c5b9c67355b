//! `spark-buffer` 提供面向 [`BufferPool`] 的具体缓冲实现。
//!
//! # 模块定位（Why）
//! - TLS 流封装在每轮解密、每个入站分片上都要用到临时 `BytesMut`；
//!   通过池化复用这些缓冲，长连接上的分配次数与峰值都可控。
//! - 流水线只依赖 [`BufferPool`] trait，测试与宿主可以注入自己的分配策略。
//!
//! # 设计概要（How）
//! - `pool` 模块定义 [`BufferPool`] 契约与 [`SlabBufferPool`] 自由链表实现；
//! - 所有公开类型均满足 `Send + Sync + 'static`，可在跨线程流水线中共享。

mod pool;

pub use pool::{BufferPool, DEFAULT_MAX_FREE_SLOTS, PoolStats, SlabBufferPool};
