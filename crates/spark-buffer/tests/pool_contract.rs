//! `pool_contract` 集成测试：验证 `SlabBufferPool` 在真实调用路径下的契约执行情况。
//!
//! # 测试目标（Why）
//! - 保障缓冲租借、回收、统计等核心流程能在 crate 公开 API 下正确协作；
//! - 通过外部 crate 视角（integration test）模拟用户调用，避免依赖内部实现细节；
//! - 及时捕获统计字段、容量回收等回归，确保后续重构仍维持行为兼容。
//!
//! # 结构安排（How）
//! - `stats_track_allocation_lifecycle`：检查租借/归还过程中各统计字段的演进；
//! - `shrink_to_fit_releases_cached_buffers`：自由链表收缩；
//! - `free_list_is_bounded`：自由链表上限；
//! - `pool_is_usable_through_trait_object`：以 `Arc<dyn BufferPool>` 形式跨线程共享。

use std::{sync::Arc, thread};

use spark_buffer::{BufferPool, SlabBufferPool};

/// 通过多次租借 / 回收验证统计字段的生命周期演进。
///
/// # 核心关注点
/// - `active_leases`：租借过程中的实时活跃数量；
/// - `reused_leases` / `pool_misses`：自由链表命中与未命中次数，首次分配必然触发一次 miss。
#[test]
fn stats_track_allocation_lifecycle() {
    let pool = SlabBufferPool::new();
    let initial = pool.statistics();
    assert_eq!(initial.active_leases, 0);
    assert_eq!(initial.pool_misses, 0);

    let first = pool.acquire(32);
    let during_first = pool.statistics();
    assert_eq!(during_first.active_leases, 1);
    assert_eq!(during_first.pool_misses, 1);
    assert!(during_first.allocated_bytes >= 32);
    pool.release(first);

    let after_first = pool.statistics();
    assert_eq!(after_first.active_leases, 0);
    assert_eq!(after_first.free_slots, 1);

    let second = pool.acquire(8);
    let during_second = pool.statistics();
    assert_eq!(during_second.active_leases, 1);
    assert_eq!(during_second.pool_misses, 1, "较小的请求应命中已缓存的块");
    assert_eq!(during_second.reused_leases, 1);
    pool.release(second);

    let after_second = pool.statistics();
    assert_eq!(after_second.active_leases, 0);
    assert_eq!(after_second.allocated_bytes, after_first.allocated_bytes);
}

/// 验证 `shrink_to_fit` 能够释放自由链表缓存并刷新统计。
#[test]
fn shrink_to_fit_releases_cached_buffers() {
    let pool = SlabBufferPool::new();
    let buffer = pool.acquire(48);
    let cached_capacity = buffer.capacity();
    pool.release(buffer);
    let reclaimed = pool.shrink_to_fit();
    assert!(
        reclaimed >= cached_capacity,
        "回收字节数至少应覆盖已缓存容量"
    );
    let stats = pool.statistics();
    assert_eq!(stats.available_bytes, 0, "收缩后不应保留闲置容量");
    assert_eq!(stats.free_slots, 0);
}

/// 归还数量超过上限时，多余的缓冲直接丢弃。
#[test]
fn free_list_is_bounded() {
    let pool = SlabBufferPool::with_max_free_slots(2);
    let leases: Vec<_> = (0..4).map(|_| pool.acquire(16)).collect();
    for lease in leases {
        pool.release(lease);
    }
    let stats = pool.statistics();
    assert_eq!(stats.free_slots, 2);
    assert_eq!(stats.active_leases, 0);
}

/// 以 trait 对象形式在多个线程间共享，统计最终收敛。
#[test]
fn pool_is_usable_through_trait_object() {
    let pool: Arc<dyn BufferPool> = Arc::new(SlabBufferPool::new());
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for round in 0..100 {
                    let mut buffer = pool.acquire(64 + round);
                    buffer.extend_from_slice(b"payload");
                    pool.release(buffer);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("工作线程不应 panic");
    }
    let stats = pool.statistics();
    assert_eq!(stats.active_leases, 0);
    assert_eq!(stats.reused_leases + stats.pool_misses, 400);
}
