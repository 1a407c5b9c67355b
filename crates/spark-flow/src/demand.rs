use std::sync::atomic::{AtomicU64, Ordering};

use crate::FlowError;

/// `Demand` 是线程安全的饱和背压计数器，记录消费者尚未兑现的请求额度。
///
/// # 模块角色（Why）
/// - 订阅者通过 `request(n)` 授予额度，发布者每投递一个元素扣减一次；
/// - 两端往往运行在不同线程，因此计数必须是无锁原子量，并且不能因溢出回绕。
///
/// # 核心机制（How）
/// - 内部为单个 `AtomicU64`；增加使用 `saturating_add`，达到 `u64::MAX` 后视为“无界需求”；
/// - 扣减全部基于 `fetch_update` 的 CAS 循环，保证任何交错下值都不会低于 0。
///
/// # 契约说明（What）
/// - **前置条件**：`increase` 的参数必须大于 0；
/// - **后置条件**：任意时刻 [`Demand::get`] 的返回值都 `>= 0`；对 0 执行
///   [`Demand::try_decrement`] 返回 `false`，计数保持为 0。
///
/// # 设计权衡（Trade-offs）
/// - 扣减失败只报告 `false`，不在计数器内部构造错误：未授权投递是否致命由调用方决定，
///   流委托在这里升级为 [`FlowError::DemandUnderflow`]。
#[derive(Debug, Default)]
pub struct Demand {
    value: AtomicU64,
}

impl Demand {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// 增加 `n` 个单位的需求，返回增加前是否为 0。
    ///
    /// # 契约说明（What）
    /// - `n == 0` 返回 [`FlowError::DemandUnderflow`]，计数不变；
    /// - 累加在 `u64::MAX` 处饱和。
    pub fn increase(&self, n: u64) -> Result<bool, FlowError> {
        if n == 0 {
            return Err(FlowError::demand_underflow(
                "request(0) carries no demand credit",
            ));
        }
        let prev = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(n))
            })
            .unwrap_or_else(|current| current);
        Ok(prev == 0)
    }

    /// 尝试扣减至多 `n` 个单位，返回实际扣减量（`0..=n`）。
    pub fn decrease_and_get(&self, n: u64) -> u64 {
        let mut taken = 0;
        let _ = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                taken = current.min(n);
                if taken == 0 {
                    None
                } else {
                    Some(current - taken)
                }
            });
        taken
    }

    /// 需求为正时扣减 1 并返回 `true`，否则不改动并返回 `false`。
    pub fn try_decrement(&self) -> bool {
        self.decrease_and_get(1) == 1
    }

    pub fn is_fulfilled(&self) -> bool {
        self.get() == 0
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increase_reports_transition_from_zero() {
        let demand = Demand::new();
        assert!(demand.increase(3).expect("首次请求应成功"));
        assert!(!demand.increase(2).expect("追加请求应成功"));
        assert_eq!(demand.get(), 5);
    }

    #[test]
    fn zero_request_is_rejected() {
        let demand = Demand::new();
        let err = demand.increase(0).expect_err("request(0) 属于误用");
        assert_eq!(err.kind(), "flow.demand_underflow");
        assert!(demand.is_fulfilled());
    }

    #[test]
    fn increase_saturates_at_max() {
        let demand = Demand::new();
        demand.increase(u64::MAX).expect("请求最大值");
        demand.increase(10).expect("饱和后继续请求");
        assert_eq!(demand.get(), u64::MAX);
    }

    #[test]
    fn decrement_against_zero_leaves_count_untouched() {
        let demand = Demand::new();
        assert!(!demand.try_decrement());
        assert_eq!(demand.get(), 0);
        demand.increase(1).expect("请求");
        assert!(demand.try_decrement());
        assert!(!demand.try_decrement());
        assert!(demand.is_fulfilled());
    }

    #[test]
    fn decrease_and_get_takes_at_most_available() {
        let demand = Demand::new();
        demand.increase(4).expect("请求");
        assert_eq!(demand.decrease_and_get(10), 4);
        assert_eq!(demand.decrease_and_get(1), 0);
    }

    #[test]
    fn reset_drops_outstanding_demand() {
        let demand = Demand::new();
        demand.increase(7).expect("请求");
        demand.reset();
        assert!(demand.is_fulfilled());
        assert!(demand.increase(1).expect("重置后重新请求"), "重置后应再次报告从零开始");
    }
}
