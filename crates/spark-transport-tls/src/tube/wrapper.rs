//! 单次订阅的信号次序保护。
//!
//! # 状态机（How）
//! ```text
//! UNSUBSCRIBED ──on_subscribe──▶ SUBSCRIBING ──回调返回──▶ ACTIVE ──终止──▶ TERMINAL
//!       │                           │
//!       └────────终止信号：置 PARKED 位，on_subscribe 返回后重放────────┘
//! ```
//! - 所有迁移都经由 [`DelegateWrapper::transition`] 的单次 CAS；
//! - 终止信号只记录一次，重复的终止信号被丢弃；
//! - 被新订阅者替换时收到 `on_detach`，此后所有信号静默丢弃。

use std::sync::{
    Arc, OnceLock, Weak,
    atomic::{AtomicBool, AtomicU8, Ordering},
};

use spark_flow::{ByteChunks, FlowError, Subscriber, Subscription};
use tracing::{trace, warn};

const PHASE_MASK: u8 = 0b011;
const UNSUBSCRIBED: u8 = 0;
const SUBSCRIBING: u8 = 1;
const ACTIVE: u8 = 2;
const TERMINAL: u8 = 3;
const PARKED: u8 = 0b100;

#[derive(Clone, Debug)]
enum Terminal {
    Error(FlowError),
    Complete,
}

pub(crate) struct DelegateWrapper {
    subscriber: Arc<dyn Subscriber<ByteChunks>>,
    state: AtomicU8,
    terminal: OnceLock<Terminal>,
    detached: AtomicBool,
}

impl DelegateWrapper {
    pub(crate) fn new(subscriber: Arc<dyn Subscriber<ByteChunks>>) -> Self {
        Self {
            subscriber,
            state: AtomicU8::new(UNSUBSCRIBED),
            terminal: OnceLock::new(),
            detached: AtomicBool::new(false),
        }
    }

    /// 唯一的状态迁移：整字节 CAS，失败时返回当前值。
    fn transition(&self, from: u8, to: u8) -> Result<u8, u8> {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
    }

    pub(crate) fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & PHASE_MASK != UNSUBSCRIBED {
                warn!("duplicate on_subscribe on a wrapped subscriber, cancelling");
                subscription.cancel();
                return;
            }
            match self.transition(current, SUBSCRIBING | (current & PARKED)) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.subscriber.on_subscribe(subscription);
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = if current & PARKED != 0 { TERMINAL } else { ACTIVE };
            match self.transition(current, next) {
                Ok(_) if next == TERMINAL => {
                    trace!("replaying terminal signal parked during on_subscribe");
                    self.deliver_terminal();
                    return;
                }
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn on_next(&self, item: ByteChunks) {
        if self.detached.load(Ordering::Acquire) {
            trace!("item for a detached subscriber dropped");
            return;
        }
        if self.state.load(Ordering::Acquire) & PHASE_MASK != ACTIVE {
            warn!("item before on_subscribe completed dropped");
            return;
        }
        self.subscriber.on_next(item);
    }

    pub(crate) fn on_error(&self, error: FlowError) {
        self.terminate(Terminal::Error(error));
    }

    pub(crate) fn on_complete(&self) {
        self.terminate(Terminal::Complete);
    }

    /// 被新订阅者替换，不投递终止信号。
    pub(crate) fn detach(&self) {
        if !self.detached.swap(true, Ordering::AcqRel) {
            self.subscriber.on_detach();
        }
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn terminate(&self, signal: Terminal) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        if self.terminal.set(signal).is_err() {
            trace!("duplicate terminal signal ignored");
            return;
        }
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current & PHASE_MASK {
                TERMINAL => return,
                ACTIVE => TERMINAL,
                _ if current & PARKED != 0 => return,
                _ => current | PARKED,
            };
            match self.transition(current, next) {
                Ok(_) if next == TERMINAL => {
                    self.deliver_terminal();
                    return;
                }
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn deliver_terminal(&self) {
        match self.terminal.get() {
            Some(Terminal::Error(error)) => self.subscriber.on_error(error.clone()),
            Some(Terminal::Complete) => self.subscriber.on_complete(),
            None => {}
        }
    }
}

/// 交给被包装订阅者的订阅句柄；订阅者被替换后所有调用失效。
pub(crate) struct ReadSubscription {
    wrapper: Weak<DelegateWrapper>,
    inner: Arc<dyn Subscription>,
}

impl ReadSubscription {
    pub(crate) fn new(wrapper: &Arc<DelegateWrapper>, inner: Arc<dyn Subscription>) -> Self {
        Self {
            wrapper: Arc::downgrade(wrapper),
            inner,
        }
    }

    fn is_current(&self) -> bool {
        self.wrapper
            .upgrade()
            .is_some_and(|wrapper| !wrapper.is_detached())
    }
}

impl Subscription for ReadSubscription {
    fn request(&self, n: u64) {
        if self.is_current() {
            self.inner.request(n);
        }
    }

    fn cancel(&self) {
        if self.is_current() {
            self.inner.cancel();
        }
    }
}
