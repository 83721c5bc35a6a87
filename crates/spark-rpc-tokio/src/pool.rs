//! 基于 Tokio 阻塞线程池的执行器。
//!
//! - **意图（Why）**：业务方法可能阻塞，执行任务不能占用异步工作线程；
//! - **契约（What）**：`submit` 返回 `Ok` 的任务恰好执行一次，执行前被运行时丢弃时记录告警；
//!   `in_flight` 计数在任何退出路径上都会归还。

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use spark_rpc::{
    ConfigError, ExecutionTask, KeyValue, Logger, RpcError, ServerOptions, TaskExecutor, codes,
    observability::keys,
};
use tokio::runtime::{Builder, Handle, Runtime};

/// 工作线程池构建失败。
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build the worker runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// 基于 Tokio 阻塞线程池的 [`TaskExecutor`]。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 业务方法可能阻塞工作线程，直接在异步工作线程上执行会拖住同一运行时里的 IO 任务；
///   因此每个执行任务都通过 `spawn_blocking` 投递到阻塞线程池；
/// - 写出完成由连接的写任务报告，与执行任务所在线程不同，这正是协议适配器通知钩子需要
///   自行同步的原因。
///
/// ## 逻辑 (How)
/// - [`with_handle`](Self::with_handle) 复用宿主已有的运行时；
/// - [`build`](Self::build) 按 [`ServerOptions`] 创建独立的多线程运行时，线程以
///   `<thread_name>-<序号>` 命名，阻塞线程池上限取自 `max_blocking_threads`；
/// - [`close`](Self::close) 之后或运行时已关闭时，提交返回 `rpc.executor.rejected`；
/// - 已接收的任务若在执行前被运行时丢弃，记录告警并归还计数。
///
/// ## 契约 (What)
/// - `submit` 不阻塞调用方；任务之间不保证执行顺序；
/// - 已提交的任务在关闭后仍会执行完毕。
///
/// ## 注意事项 (Trade-offs)
/// - `build` 创建的运行时随线程池一起释放，释放时会等待仍在执行的阻塞任务；不要在异步上下文中
///   丢弃自有运行时的线程池。
pub struct TokioWorkerPool {
    handle: Handle,
    runtime: Option<Runtime>,
    logger: Arc<dyn Logger>,
    closed: AtomicBool,
    in_flight: Arc<AtomicUsize>,
}

impl TokioWorkerPool {
    /// 在已有运行时上调度任务。
    pub fn with_handle(handle: Handle, logger: Arc<dyn Logger>) -> Self {
        Self {
            handle,
            runtime: None,
            logger,
            closed: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 按配置创建独立运行时。
    pub fn build(options: &ServerOptions, logger: Arc<dyn Logger>) -> Result<Self, PoolError> {
        options.validate()?;
        let prefix = options.thread_name().to_owned();
        let sequence = AtomicUsize::new(0);
        let runtime = Builder::new_multi_thread()
            .worker_threads(options.worker_threads())
            .max_blocking_threads(options.max_blocking_threads())
            .thread_name_fn(move || {
                let id = sequence.fetch_add(1, Ordering::Relaxed);
                format!("{prefix}-{id}")
            })
            .build()?;
        logger.info_with_fields(
            "worker pool started",
            &[
                KeyValue::new("pool.worker_threads", options.worker_threads()),
                KeyValue::new("pool.max_blocking_threads", options.max_blocking_threads()),
            ],
        );
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            logger,
            closed: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// 停止接收新任务。
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.logger.info_with_fields(
                "worker pool closed",
                &[KeyValue::new("pool.in_flight", self.in_flight())],
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 已提交但尚未结束的任务数。
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn owns_runtime(&self) -> bool {
        self.runtime.is_some()
    }
}

impl TaskExecutor for TokioWorkerPool {
    fn submit(&self, task: ExecutionTask) -> Result<(), RpcError> {
        let log_id = task.log_id();
        if self.is_closed() {
            self.logger.warn_with_fields(
                "worker pool rejected task after close",
                &[KeyValue::new(keys::LOG_ID, log_id)],
            );
            return Err(RpcError::new(
                codes::EXECUTOR_REJECTED,
                "worker pool is closed",
            ));
        }
        let pending = PendingTask::new(task, Arc::clone(&self.in_flight), Arc::clone(&self.logger));
        let dropped = Arc::clone(&pending.dropped);
        self.handle.spawn_blocking(move || pending.run());
        // 运行时已关闭时，阻塞池在 `spawn_blocking` 内同步丢弃闭包。
        if dropped.load(Ordering::SeqCst) {
            return Err(RpcError::new(
                codes::EXECUTOR_REJECTED,
                format!("worker runtime is shut down, log_id={log_id}"),
            ));
        }
        Ok(())
    }
}

/// 已被接收、尚未结束的任务。
///
/// 无论任务正常结束、`execute` 展开还是闭包在执行前被运行时丢弃，`Drop` 都会归还
/// `in_flight` 计数；未执行即被丢弃时记录告警并置位 `dropped`。
struct PendingTask {
    task: Option<ExecutionTask>,
    in_flight: Arc<AtomicUsize>,
    logger: Arc<dyn Logger>,
    dropped: Arc<AtomicBool>,
}

impl PendingTask {
    fn new(task: ExecutionTask, in_flight: Arc<AtomicUsize>, logger: Arc<dyn Logger>) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            task: Some(task),
            in_flight,
            logger,
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn run(mut self) {
        if let Some(task) = self.task.take() {
            task.execute();
        }
    }
}

impl Drop for PendingTask {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            self.dropped.store(true, Ordering::SeqCst);
            self.logger.warn_with_fields(
                "execution task dropped before execution",
                &[
                    KeyValue::new(keys::LOG_ID, task.log_id()),
                    KeyValue::new(keys::CHANNEL_ID, task.channel_id()),
                ],
            );
        }
    }
}

impl fmt::Debug for TokioWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioWorkerPool")
            .field("owns_runtime", &self.owns_runtime())
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
