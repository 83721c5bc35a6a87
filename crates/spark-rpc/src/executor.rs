//! 任务调度契约。
//!
//! # 教案式说明
//! - **意图（Why）**：执行任务可能在业务逻辑里阻塞，调度策略（线程池大小、阻塞池、内联执行）
//!   属于宿主进程的决定，执行管线只依赖“提交一个任务”这一能力；
//! - **契约（What）**：
//!   - [`TaskExecutor::submit`] 接收任务的所有权，成功返回即表示任务终将被执行一次；
//!   - 无法接收时返回 [`codes::EXECUTOR_REJECTED`] 错误，任务随之丢弃，不做任何回写；
//!   - 同一连接上的多个任务之间不保证执行顺序。
//!
//! [`codes::EXECUTOR_REJECTED`]: crate::error::codes::EXECUTOR_REJECTED

use crate::{error::RpcError, task::ExecutionTask};

/// 执行任务的调度器。
pub trait TaskExecutor: Send + Sync + 'static {
    /// 提交任务。
    fn submit(&self, task: ExecutionTask) -> Result<(), RpcError>;
}

/// 在调用线程上立即执行任务。
///
/// 适合测试与单线程宿主；业务逻辑阻塞时会同时阻塞传输层的读循环。
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl InlineExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl TaskExecutor for InlineExecutor {
    fn submit(&self, task: ExecutionTask) -> Result<(), RpcError> {
        task.execute();
        Ok(())
    }
}
