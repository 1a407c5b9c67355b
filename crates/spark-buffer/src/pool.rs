use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use spin::Mutex;

/// 自由链表默认保留的最大缓冲块数。
pub const DEFAULT_MAX_FREE_SLOTS: usize = 64;

/// `BufferPool` 描述“按最小容量租借、用完归还”的分配器接口。
///
/// # 契约说明（What）
/// - `acquire(min)` 返回长度为 0、`capacity() >= min` 的 `BytesMut`；
/// - `release` 接收任意来源的 `BytesMut`，实现可以缓存复用，也可以直接丢弃；
/// - 调用方不需要归还每一块缓冲：未归还的缓冲在 `Drop` 时正常释放，只是无法复用。
pub trait BufferPool: Send + Sync + 'static {
    fn acquire(&self, min_capacity: usize) -> BytesMut;

    fn release(&self, buffer: BytesMut);

    /// 清空缓存的闲置缓冲，返回释放的字节数。
    fn shrink_to_fit(&self) -> usize;

    fn statistics(&self) -> PoolStats;
}

impl<P: BufferPool + ?Sized> BufferPool for Arc<P> {
    fn acquire(&self, min_capacity: usize) -> BytesMut {
        (**self).acquire(min_capacity)
    }

    fn release(&self, buffer: BytesMut) {
        (**self).release(buffer)
    }

    fn shrink_to_fit(&self) -> usize {
        (**self).shrink_to_fit()
    }

    fn statistics(&self) -> PoolStats {
        (**self).statistics()
    }
}

/// 缓冲池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 池从堆上申请、且仍由池或租借方持有的字节数。
    pub allocated_bytes: usize,
    /// 自由链表中闲置的字节数。
    pub available_bytes: usize,
    /// 已租出未归还的缓冲数量。
    pub active_leases: usize,
    /// 自由链表当前块数。
    pub free_slots: usize,
    /// 命中自由链表的租借次数。
    pub reused_leases: u64,
    /// 未命中、需要新分配的租借次数。
    pub pool_misses: u64,
}

/// TLS 记录缓冲的默认池：有上限的自由链表，按“最小够用”挑选闲置块。
///
/// # 模块角色（Why）
/// - Reader 的累积缓冲与解密目标、Writer 的密文输出缓冲在每轮循环都要申请；
///   同一连接上的需求大小集中在一两个档位（初始容量与单条记录上限），非常适合复用。
///
/// # 核心机制（How）
/// - 闲置块保存在 `spin::Mutex<Vec<BytesMut>>` 中；租借时选择容量满足要求的最小块，
///   让 16 KiB 的记录缓冲不会被 1 KiB 的小请求占走；
/// - 归还时清空内容，链表已满则直接释放；
/// - `Ledger` 用原子计数记录字节与租借数量，`statistics()` 只读取快照，不阻塞租借路径。
///
/// # 契约说明（What）
/// - 克隆得到的句柄共享同一条自由链表；
/// - `with_max_free_slots(0)` 得到一个只分配、不缓存的池，便于在测试中排除复用干扰。
///
/// # 风险提示（Trade-offs）
/// - 最小够用的挑选需要遍历整条链表，链表上限因此保持在几十块的量级。
#[derive(Clone)]
pub struct SlabBufferPool {
    shared: Arc<Slab>,
}

impl Default for SlabBufferPool {
    fn default() -> Self {
        Self::with_max_free_slots(DEFAULT_MAX_FREE_SLOTS)
    }
}

impl SlabBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定自由链表上限；`0` 表示不缓存任何缓冲。
    pub fn with_max_free_slots(max_free_slots: usize) -> Self {
        Self {
            shared: Arc::new(Slab {
                idle: Mutex::new(Vec::with_capacity(max_free_slots.min(DEFAULT_MAX_FREE_SLOTS))),
                max_free_slots,
                ledger: Ledger::default(),
            }),
        }
    }
}

impl BufferPool for SlabBufferPool {
    fn acquire(&self, min_capacity: usize) -> BytesMut {
        let mut buffer = match self.shared.take_idle(min_capacity) {
            Some(buffer) => {
                self.shared.ledger.record_reuse();
                buffer
            }
            None => {
                let buffer = BytesMut::with_capacity(min_capacity);
                self.shared.ledger.record_fresh(buffer.capacity());
                buffer
            }
        };
        buffer.clear();
        buffer
    }

    fn release(&self, mut buffer: BytesMut) {
        self.shared.ledger.active_leases.release_one();
        buffer.clear();
        let capacity = buffer.capacity();
        if capacity == 0 {
            return;
        }
        let mut idle = self.shared.idle.lock();
        if idle.len() < self.shared.max_free_slots {
            idle.push(buffer);
            self.shared.ledger.available_bytes.add(capacity);
        } else {
            drop(idle);
            self.shared.ledger.allocated_bytes.sub(capacity);
        }
    }

    fn shrink_to_fit(&self) -> usize {
        let purged: Vec<BytesMut> = core::mem::take(&mut *self.shared.idle.lock());
        let freed = purged.iter().map(BytesMut::capacity).sum();
        self.shared.ledger.available_bytes.sub(freed);
        self.shared.ledger.allocated_bytes.sub(freed);
        freed
    }

    fn statistics(&self) -> PoolStats {
        let free_slots = self.shared.idle.lock().len();
        let ledger = &self.shared.ledger;
        PoolStats {
            allocated_bytes: ledger.allocated_bytes.get(),
            available_bytes: ledger.available_bytes.get(),
            active_leases: ledger.active_leases.get(),
            free_slots,
            reused_leases: ledger.reused.load(Ordering::Relaxed),
            pool_misses: ledger.misses.load(Ordering::Relaxed),
        }
    }
}

struct Slab {
    idle: Mutex<Vec<BytesMut>>,
    max_free_slots: usize,
    ledger: Ledger,
}

impl Slab {
    /// 取出容量不小于 `min_capacity` 的最小闲置块。
    fn take_idle(&self, min_capacity: usize) -> Option<BytesMut> {
        let mut idle = self.idle.lock();
        let index = idle
            .iter()
            .enumerate()
            .filter(|(_, buffer)| buffer.capacity() >= min_capacity)
            .min_by_key(|(_, buffer)| buffer.capacity())
            .map(|(index, _)| index)?;
        let buffer = idle.swap_remove(index);
        drop(idle);
        self.ledger.available_bytes.sub(buffer.capacity());
        Some(buffer)
    }
}

#[derive(Default)]
struct Ledger {
    allocated_bytes: Gauge,
    available_bytes: Gauge,
    active_leases: Gauge,
    reused: AtomicU64,
    misses: AtomicU64,
}

impl Ledger {
    fn record_fresh(&self, capacity: usize) {
        self.allocated_bytes.add(capacity);
        self.active_leases.add(1);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reuse(&self) {
        self.active_leases.add(1);
        self.reused.fetch_add(1, Ordering::Relaxed);
    }
}

/// 不会下溢的计数器；外来缓冲的归还可能让扣减量超过记录值。
#[derive(Default)]
struct Gauge(AtomicUsize);

impl Gauge {
    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn sub(&self, value: usize) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(value))
            });
    }

    fn release_one(&self) {
        self.sub(1);
    }
}
