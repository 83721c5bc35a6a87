//! 服务端分发入口。
//!
//! # 教案式概览
//! - **意图（Why）**：拦截器列表、日志能力与调度器是进程级配置，在启动时装配一次，之后每个
//!   请求只读共享。[`RpcServer`] 把它们收拢在一起，传输层每解码一个请求就调用一次
//!   [`RpcServer::dispatch`]。
//! - **逻辑（How）**：构建器冻结拦截器列表为 `Arc<[..]>`；`dispatch` 为请求创建
//!   [`ExecutionTask`] 并交给 [`TaskExecutor`]，调度器拒绝时记录告警并把错误返回给传输层。
//! - **契约（What）**：`RpcServer` 可廉价克隆，克隆体共享同一份配置；运行期不提供修改拦截器
//!   列表的入口。

use std::{fmt, sync::Arc};

use crate::{
    channel::Channel,
    error::RpcError,
    executor::{InlineExecutor, TaskExecutor},
    interceptor::{Interceptor, InterceptorChain},
    message::{Request, Response},
    observability::{KeyValue, LogRecord, LogSeverity, Logger, TracingLogger, keys},
    protocol::ProtocolAdapter,
    task::{ExecutionTask, ServerContext},
};

/// [`RpcServer`] 的构建器。
#[derive(Default)]
pub struct RpcServerBuilder {
    interceptors: Vec<Arc<dyn Interceptor>>,
    logger: Option<Arc<dyn Logger>>,
    executor: Option<Arc<dyn TaskExecutor>>,
}

impl RpcServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加拦截器；先追加的位于外层。
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn shared_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// 注入日志能力，缺省为 [`TracingLogger`]。
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// 注入调度器，缺省为 [`InlineExecutor`]。
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> RpcServer {
        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(TracingLogger::new()));
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(InlineExecutor::new()));
        RpcServer {
            context: ServerContext::new(InterceptorChain::new(self.interceptors), logger),
            executor,
        }
    }
}

/// 服务端分发器。
#[derive(Clone)]
pub struct RpcServer {
    context: ServerContext,
    executor: Arc<dyn TaskExecutor>,
}

impl RpcServer {
    pub fn builder() -> RpcServerBuilder {
        RpcServerBuilder::new()
    }

    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    /// 为请求创建执行任务但不提交，适合宿主自行决定执行位置。
    pub fn task(
        &self,
        protocol: Arc<dyn ProtocolAdapter>,
        channel: Arc<dyn Channel>,
        request: Option<Request>,
        response: Response,
    ) -> ExecutionTask {
        ExecutionTask::new(self.context.clone(), protocol, channel, request, response)
    }

    /// 创建执行任务并提交给调度器。
    ///
    /// 调度器拒绝时任务被丢弃，不产生任何回写；错误同时记录告警并返回给调用方，由传输层决定
    /// 是否关闭连接。
    pub fn dispatch(
        &self,
        protocol: Arc<dyn ProtocolAdapter>,
        channel: Arc<dyn Channel>,
        request: Option<Request>,
        response: Response,
    ) -> Result<(), RpcError> {
        let channel_id = channel.id().to_owned();
        let task = self.task(protocol, channel, request, response);
        let log_id = task.log_id();
        self.executor.submit(task).inspect_err(|err| {
            let attributes = [
                KeyValue::new(keys::LOG_ID, log_id),
                KeyValue::new(keys::CHANNEL_ID, channel_id.as_str()),
                KeyValue::new(keys::ERROR_CODE, err.code()),
            ];
            self.context.logger().log(
                &LogRecord::new("execution task rejected by executor", LogSeverity::Warn, &attributes)
                    .with_error(err),
            );
        })
    }
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
