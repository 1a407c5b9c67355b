//! `Demand` 计数器性质验证。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：背压计数在任意 `request(n)` 与内部扣减的交错下都不得为负，
//!   也不得因溢出回绕成一个很小的值（那会让发布者误以为额度耗尽而永久停滞）。
//! - **设计手法 (How)**：用 proptest 生成随机操作序列，同时维护一个以 `u128` 计算、
//!   手动饱和的影子模型，逐步比对生产实现与模型。
//! - **合同与边界 (What)**：
//!   - 输入：`Increase(n)`（`n` 可为 0，用于验证误用拒绝）、`TryDecrement`、`DecreaseUpTo(n)`、`Reset`；
//!   - 断言：每一步后实现值与模型值一致，扣减量不超过当时的余额。

use proptest::prelude::*;
use spark_flow::{Demand, FlowError};

#[derive(Clone, Debug)]
enum Op {
    Increase(u64),
    TryDecrement,
    DecreaseUpTo(u64),
    Reset,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => prop_oneof![Just(0u64), 1u64..1_000, Just(u64::MAX - 1), Just(u64::MAX)].prop_map(Op::Increase),
        4 => Just(Op::TryDecrement),
        2 => (0u64..2_000).prop_map(Op::DecreaseUpTo),
        1 => Just(Op::Reset),
    ]
}

proptest! {
    #[test]
    fn prop_demand_never_negative_and_matches_model(ops in prop::collection::vec(op_strategy(), 1..64)) {
        let demand = Demand::new();
        let mut model: u64 = 0;
        for op in ops {
            match op {
                Op::Increase(n) => {
                    let outcome = demand.increase(n);
                    if n == 0 {
                        prop_assert!(matches!(outcome, Err(FlowError::DemandUnderflow { .. })), "expected DemandUnderflow, got {:?}", outcome);
                    } else {
                        prop_assert_eq!(outcome.ok(), Some(model == 0));
                        model = model.saturating_add(n);
                    }
                }
                Op::TryDecrement => {
                    let taken = demand.try_decrement();
                    prop_assert_eq!(taken, model > 0);
                    if taken {
                        model -= 1;
                    }
                }
                Op::DecreaseUpTo(n) => {
                    let taken = demand.decrease_and_get(n);
                    prop_assert_eq!(taken, model.min(n));
                    model -= taken;
                }
                Op::Reset => {
                    demand.reset();
                    model = 0;
                }
            }
            prop_assert_eq!(demand.get(), model);
        }
    }
}

/// 多线程并发扣减：授予的额度恰好被消费一次，不会多扣也不会少扣。
#[test]
fn concurrent_decrements_consume_exact_credit() {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        thread,
    };

    let demand = Arc::new(Demand::new());
    demand.increase(10_000).expect("授予额度");
    let consumed = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let demand = Arc::clone(&demand);
            let consumed = Arc::clone(&consumed);
            thread::spawn(move || {
                while demand.try_decrement() {
                    consumed.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("工作线程不应 panic");
    }
    assert_eq!(consumed.load(Ordering::Relaxed), 10_000);
    assert!(demand.is_fulfilled());
}
