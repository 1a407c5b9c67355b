use std::collections::VecDeque;

use bytes::{Buf, Bytes};

/// Writer 待加密列表中的元素。
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PendingWrite {
    Data(Bytes),
    /// 强制再执行一次 `wrap`，握手需要输出而没有应用数据时插入。
    HandshakeTrigger,
    /// 上游已经结束。
    CompletionMarker,
}

/// 有序的待加密列表。
///
/// - **契约 (What)**：出现 `CompletionMarker` 之后拒绝追加数据；
///   `consume` 按顺序扣除已加密的字节并移除全部触发标记。
#[derive(Debug, Default)]
pub(crate) struct PendingWriteList {
    items: VecDeque<PendingWrite>,
    completing: bool,
}

impl PendingWriteList {
    /// 追加数据；已标记完成时返回 `false` 且不追加。
    pub(crate) fn push_data(&mut self, bytes: Bytes) -> bool {
        if self.completing {
            return false;
        }
        if !bytes.is_empty() {
            self.items.push_back(PendingWrite::Data(bytes));
        }
        true
    }

    /// 列表为空时插入触发标记。
    pub(crate) fn push_trigger_if_empty(&mut self) -> bool {
        if self.items.is_empty() {
            self.items.push_back(PendingWrite::HandshakeTrigger);
            true
        } else {
            false
        }
    }

    pub(crate) fn push_trigger(&mut self) {
        if !self.has_trigger() {
            self.items.push_back(PendingWrite::HandshakeTrigger);
        }
    }

    /// 追加完成标记，重复调用无效果。
    pub(crate) fn mark_completion(&mut self) -> bool {
        if self.completing {
            return false;
        }
        self.completing = true;
        self.items.push_back(PendingWrite::CompletionMarker);
        true
    }

    pub(crate) fn is_completing(&self) -> bool {
        self.completing
    }

    pub(crate) fn has_trigger(&self) -> bool {
        self.items
            .iter()
            .any(|item| matches!(item, PendingWrite::HandshakeTrigger))
    }

    pub(crate) fn data_chunks(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, PendingWrite::Data(_)))
            .count()
    }

    pub(crate) fn data_remaining(&self) -> usize {
        self.items
            .iter()
            .map(|item| match item {
                PendingWrite::Data(bytes) => bytes.len(),
                _ => 0,
            })
            .sum()
    }

    pub(crate) fn data_snapshot(&self) -> Vec<Bytes> {
        self.items
            .iter()
            .filter_map(|item| match item {
                PendingWrite::Data(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// 扣除 `consumed` 个已加密字节，并移除所有触发标记。
    pub(crate) fn consume(&mut self, mut consumed: usize) {
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            match item {
                PendingWrite::Data(mut bytes) => {
                    if consumed >= bytes.len() {
                        consumed -= bytes.len();
                    } else {
                        bytes.advance(consumed);
                        consumed = 0;
                        kept.push_back(PendingWrite::Data(bytes));
                    }
                }
                PendingWrite::HandshakeTrigger => {}
                PendingWrite::CompletionMarker => kept.push_back(PendingWrite::CompletionMarker),
            }
        }
        self.items = kept;
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}
