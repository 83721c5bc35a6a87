//! 连接协作者契约与写完成句柄。
//!
//! # 教案式概览
//! - **意图（Why）**：执行任务只负责“发起”一次写出，写出是否真正落到内核缓冲由传输层在另一个
//!   执行上下文里报告。任务与协议适配器需要一个可以挂接后续动作、也可以被等待的句柄。
//! - **逻辑（How）**：
//!   - [`write_completion`] 生成一对 [`WritePromise`]/[`WriteCompletion`]，二者共享一个受
//!     `parking_lot::Mutex` 保护的状态槽；
//!   - 传输层持有 promise，写出结束后调用 [`WritePromise::complete`]，在**完成线程**上依次执行
//!     已登记的监听器并唤醒等待的 `Future`；
//!   - promise 未完成即被丢弃时，以 [`TransportError::Abandoned`] 完成，等待方不会永久挂起。
//! - **契约（What）**：
//!   - 每个句柄恰好完成一次，结果对所有克隆可见；
//!   - 在已完成的句柄上登记监听器，监听器立即在调用线程执行；
//!   - 监听器不应阻塞；监听器 panic 会被隔离，不影响其余监听器与完成线程。

use std::{
    fmt,
    future::Future,
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::TransportError;

/// 写出结果。
pub type WriteResult = Result<(), TransportError>;

type Listener = Box<dyn FnOnce(&WriteResult) + Send + 'static>;

/// 请求所属的连接。
///
/// # 契约说明（What）
/// - 同一连接上的所有任务共享同一个 `Channel`，写队列的顺序与线程安全由实现负责；
/// - `write_async` 不得阻塞，立即返回写完成句柄；写出失败通过句柄报告，不以 panic 或返回值报告；
/// - `close` 幂等，关闭后的写出以 [`TransportError::Closed`] 完成。
pub trait Channel: Send + Sync + 'static {
    /// 连接标识，仅用于日志与诊断。
    fn id(&self) -> &str;

    /// 对端地址；传输层无法提供时为 `None`。
    fn remote_address(&self) -> Option<SocketAddr>;

    /// 异步写出一段已编码的字节。
    fn write_async(&self, bytes: Bytes) -> WriteCompletion;

    /// 关闭连接。
    fn close(&self);

    fn is_active(&self) -> bool;
}

#[derive(Default)]
struct CompletionState {
    result: Option<WriteResult>,
    listeners: Vec<Listener>,
    wakers: Vec<Waker>,
}

/// 创建一对写完成 promise 与句柄。
pub fn write_completion() -> (WritePromise, WriteCompletion) {
    let state = Arc::new(Mutex::new(CompletionState::default()));
    (
        WritePromise {
            state: Some(Arc::clone(&state)),
        },
        WriteCompletion { state },
    )
}

/// 传输层持有的完成端。
pub struct WritePromise {
    state: Option<Arc<Mutex<CompletionState>>>,
}

impl WritePromise {
    /// 以给定结果完成句柄，返回发生 panic 的监听器数量。
    pub fn complete(mut self, result: WriteResult) -> usize {
        match self.state.take() {
            Some(state) => settle(&state, result),
            None => 0,
        }
    }

    pub fn succeed(self) -> usize {
        self.complete(Ok(()))
    }

    pub fn fail(self, error: TransportError) -> usize {
        self.complete(Err(error))
    }
}

impl Drop for WritePromise {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            settle(&state, Err(TransportError::Abandoned));
        }
    }
}

impl fmt::Debug for WritePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritePromise")
            .field("pending", &self.state.is_some())
            .finish()
    }
}

fn settle(state: &Mutex<CompletionState>, result: WriteResult) -> usize {
    let (listeners, wakers) = {
        let mut guard = state.lock();
        if guard.result.is_some() {
            return 0;
        }
        guard.result = Some(result.clone());
        (
            std::mem::take(&mut guard.listeners),
            std::mem::take(&mut guard.wakers),
        )
    };

    let mut panicked = 0;
    for listener in listeners {
        if !run_listener(listener, &result) {
            panicked += 1;
        }
    }
    for waker in wakers {
        waker.wake();
    }
    panicked
}

/// 执行单个监听器；监听器 panic 时返回 `false`。
fn run_listener(listener: Listener, result: &WriteResult) -> bool {
    catch_unwind(AssertUnwindSafe(|| listener(result))).is_ok()
}

/// 写完成句柄。
///
/// 可克隆；既可以通过 [`on_complete`](Self::on_complete) 挂接回调，也可以直接 `.await`。
#[derive(Clone)]
pub struct WriteCompletion {
    state: Arc<Mutex<CompletionState>>,
}

impl WriteCompletion {
    /// 构造已完成的句柄，适用于同步即可判定结果的写出（例如连接已关闭）。
    pub fn ready(result: WriteResult) -> Self {
        let (promise, completion) = write_completion();
        promise.complete(result);
        completion
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().result.is_some()
    }

    /// 已完成时返回结果。
    pub fn result(&self) -> Option<WriteResult> {
        self.state.lock().result.clone()
    }

    /// 登记完成监听器。
    ///
    /// 尚未完成时，监听器在完成线程上执行；已完成时立即在当前线程执行。
    ///
    /// 返回 `false` 表示监听器已在当前线程执行且发生了 panic；panic 不会传播给调用方。
    pub fn on_complete<F>(&self, listener: F) -> bool
    where
        F: FnOnce(&WriteResult) + Send + 'static,
    {
        let mut guard = self.state.lock();
        match guard.result.clone() {
            Some(result) => {
                drop(guard);
                run_listener(Box::new(listener), &result)
            }
            None => {
                guard.listeners.push(Box::new(listener));
                true
            }
        }
    }
}

impl Future for WriteCompletion {
    type Output = WriteResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.state.lock();
        if let Some(result) = guard.result.clone() {
            return Poll::Ready(result);
        }
        if !guard.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            guard.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for WriteCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteCompletion")
            .field("result", &self.result())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::{AtomicUsize, Ordering}, thread};

    use super::*;

    #[test]
    fn listeners_run_once_on_completion() {
        let (promise, completion) = write_completion();
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        completion.on_complete(move |result| {
            assert!(result.is_ok());
            observed.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!completion.is_done());

        promise.succeed();

        assert!(completion.is_done());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(completion.result(), Some(Ok(())));
    }

    #[test]
    fn late_listener_runs_immediately() {
        let completion = WriteCompletion::ready(Err(TransportError::Closed));
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        completion.on_complete(move |result| *slot.lock() = Some(result.clone()));
        assert_eq!(*seen.lock(), Some(Err(TransportError::Closed)));
    }

    #[test]
    fn late_listener_panic_stays_with_the_handle() {
        let completion = WriteCompletion::ready(Err(TransportError::Closed));
        let hits = Arc::new(AtomicUsize::new(0));

        let caller = std::panic::catch_unwind(AssertUnwindSafe(|| {
            completion.on_complete(|_| panic!("late listener bug"))
        }));
        let observed = Arc::clone(&hits);
        let second = completion.on_complete(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(caller.ok(), Some(false));
        assert!(second);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_promise_reports_abandoned() {
        let (promise, completion) = write_completion();
        drop(promise);
        assert_eq!(completion.result(), Some(Err(TransportError::Abandoned)));
    }

    #[test]
    fn listener_panic_is_contained() {
        let (promise, completion) = write_completion();
        let hits = Arc::new(AtomicUsize::new(0));
        completion.on_complete(|_| panic!("listener bug"));
        let observed = Arc::clone(&hits);
        completion.on_complete(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(promise.succeed(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn future_resolves_from_another_thread() {
        let (promise, completion) = write_completion();
        let writer = thread::spawn(move || {
            promise.fail(TransportError::Io("broken pipe".into()));
        });
        let result = futures::executor::block_on(completion.clone());
        writer.join().expect("writer thread");
        assert_eq!(result, Err(TransportError::Io("broken pipe".into())));
    }
}
