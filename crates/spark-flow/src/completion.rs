use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::FlowError;

type Callback<T> = Box<dyn FnOnce(&Result<T, FlowError>) + Send>;

/// `Completion` 是“首个结果胜出”的一次性完成信号。
///
/// # 教案式说明
/// - **意图 (Why)**：TLS 委托的读写两个方向、ALPN 协商结果都需要一个只解析一次的汇聚点：
///   所有错误都收敛到这里，清理动作也只从这里触发一次。
/// - **逻辑 (How)**：
///   - 内部以 `parking_lot::Mutex` 保护结果、回调与异步唤醒器，`Condvar` 服务阻塞等待；
///   - 解析时在锁内写入结果并取走回调与唤醒器，**释放锁之后**再执行，避免回调重入造成死锁。
/// - **契约 (What)**：
///   - [`Completion::resolve`] 只有第一次调用生效并返回 `true`，之后的调用被丢弃且无副作用；
///   - 晚于解析注册的回调会在注册线程上立即执行；
///   - 克隆得到的句柄共享同一状态。
/// - **设计权衡 (Trade-offs)**：`T: Clone` 约束使每个观察者都拿到独立副本，代价是一次克隆。
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    resolved: Condvar,
}

struct State<T> {
    outcome: Option<Result<T, FlowError>>,
    callbacks: Vec<Callback<T>>,
    wakers: Vec<Waker>,
}

impl<T: Clone + Send + 'static> Completion<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    callbacks: Vec::new(),
                    wakers: Vec::new(),
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    pub fn complete(&self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(&self, error: FlowError) -> bool {
        self.resolve(Err(error))
    }

    /// 写入结果；仅第一次调用生效。
    pub fn resolve(&self, outcome: Result<T, FlowError>) -> bool {
        let (callbacks, wakers) = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.wakers),
            )
        };
        self.inner.resolved.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    pub fn peek(&self) -> Option<Result<T, FlowError>> {
        self.inner.state.lock().outcome.clone()
    }

    /// 注册解析回调；已经解析时在当前线程立即执行。
    pub fn on_resolved(&self, callback: impl FnOnce(&Result<T, FlowError>) + Send + 'static) {
        let ready = {
            let mut state = self.inner.state.lock();
            match &state.outcome {
                Some(outcome) => Some(outcome.clone()),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(outcome) = ready {
            callback(&outcome);
        }
    }

    /// 返回等待结果的 `Future`。
    pub fn wait(&self) -> Wait<T> {
        Wait {
            inner: Arc::clone(&self.inner),
        }
    }

    /// 阻塞当前线程直至解析或超时；超时返回 `None`。
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, FlowError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.outcome.is_none() {
            if self
                .inner
                .resolved
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        state.outcome.clone()
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Completion")
            .field("outcome", &state.outcome)
            .field("pending_callbacks", &state.callbacks.len())
            .finish()
    }
}

/// [`Completion::wait`] 返回的 `Future`。
pub struct Wait<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone> Future for Wait<T> {
    type Output = Result<T, FlowError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
