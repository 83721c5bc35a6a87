//! 执行任务：把一个已解码请求变成一个已编码响应的工作单元。
//!
//! # 教案式概览
//!
//! ## 意图 (Why)
//! - 单个坏请求不能拖垮工作线程或污染连接。任务把控制器装配、拦截器链、编码与异步回写
//!   串成固定顺序，并在每一步隔离失败；
//! - 工作线程上执行的部分与完成线程上执行的部分在这里交接：任务只负责“发起”写出并把
//!   [`WriteCompletion`] 交给协议适配器。
//!
//! ## 逻辑 (How)
//! 1. 存在请求时绑定连接；方法声明需要控制器或请求携带任一附件时创建 [`Controller`]；
//! 2. 把关联 ID、压缩类型、方法描述与预置异常镜像到响应；
//! 3. 响应仍无异常时执行拦截器链，成功则复制控制器写槽，失败则分类后写入响应异常；
//! 4. 无条件编码响应；编码失败记录日志后终止，既不写出也不通知；
//! 5. 编码成功则在连接上发起一次异步写出，并立刻通知协议适配器，不等待写出完成。
//!
//! ## 契约 (What)
//! - [`ExecutionTask::execute`] 消耗任务本身，实例只能使用一次；
//! - 任务从不向调用方抛出失败，拦截器链、编码器、通知钩子与注入日志实现中的 panic 都在任务边界被捕获；
//! - 状态只能前进，见 [`TaskState`]。
//!
//! ## 风险 (Trade-offs)
//! - 拦截器链 panic 后，请求与响应可能处于部分修改状态；任务仍按失败响应继续编码回写。

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    thread,
};

use crate::{
    attachment,
    channel::{Channel, WriteCompletion},
    controller::Controller,
    error::{EncodingError, RpcError, TransportError, codes, panic_message},
    interceptor::InterceptorChain,
    message::{Request, Response},
    observability::{KeyValue, LogRecord, LogSeverity, Logger, keys},
    protocol::ProtocolAdapter,
};

/// 状态推进结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateAdvance<S>
where
    S: Copy + Eq,
{
    /// 状态未变化。
    Noop { state: S },
    /// 状态发生跃迁。
    Transition { from: S, to: S },
}

/// 执行任务的生命周期状态。
///
/// ```text
/// Created ─▶ ControllerBound ─▶ ChainSkipped ─┐
///    │                      ├─▶ ChainSucceeded ├─▶ Encoded ─▶ WriteIssued ─▶ Notified
///    └──────▶ ChainSkipped  └─▶ ChainRecovered ┘      └─▶ EncodeFailed
/// ```
///
/// `ChainSkipped` 覆盖两种情况：请求携带预置异常，或任务根本没有请求对象。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    Created,
    ControllerBound,
    ChainSkipped,
    ChainSucceeded,
    ChainRecovered,
    Encoded,
    EncodeFailed,
    WriteIssued,
    Notified,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::ControllerBound => "controller_bound",
            Self::ChainSkipped => "chain_skipped",
            Self::ChainSucceeded => "chain_succeeded",
            Self::ChainRecovered => "chain_recovered",
            Self::Encoded => "encoded",
            Self::EncodeFailed => "encode_failed",
            Self::WriteIssued => "write_issued",
            Self::Notified => "notified",
        }
    }

    /// 终态：之后不会再有任何跃迁。
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::EncodeFailed | Self::Notified)
    }

    fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, ControllerBound | ChainSkipped)
                | (ControllerBound, ChainSkipped | ChainSucceeded | ChainRecovered)
                | (ChainSkipped | ChainSucceeded | ChainRecovered, Encoded | EncodeFailed)
                | (Encoded, WriteIssued)
                | (WriteIssued, Notified)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 非法跃迁。
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("illegal task transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: TaskState,
    pub to: TaskState,
}

/// 只进不退的任务状态机。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskLifecycle {
    state: TaskState,
}

impl Default for TaskLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskLifecycle {
    pub fn new() -> Self {
        Self {
            state: TaskState::Created,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// 推进到 `next`；重复进入当前状态视为 `Noop`，其余不在状态图上的跃迁返回错误且不改变状态。
    pub fn advance(&mut self, next: TaskState) -> Result<StateAdvance<TaskState>, IllegalTransition> {
        if next == self.state {
            return Ok(StateAdvance::Noop { state: next });
        }
        if !self.state.can_advance_to(next) {
            return Err(IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        let from = std::mem::replace(&mut self.state, next);
        Ok(StateAdvance::Transition { from, to: next })
    }
}

/// 服务端范围内所有任务共享的只读上下文。
#[derive(Clone)]
pub struct ServerContext {
    chain: InterceptorChain,
    logger: Arc<dyn Logger>,
}

impl ServerContext {
    pub fn new(chain: InterceptorChain, logger: Arc<dyn Logger>) -> Self {
        Self { chain, logger }
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

/// 任务执行完毕后的观测结果。
#[derive(Debug)]
pub struct TaskReport {
    state: TaskState,
    request: Option<Request>,
    response: Response,
}

impl TaskReport {
    /// 终态，`Notified` 或 `EncodeFailed`。
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    /// 是否发起过写出。
    pub fn write_issued(&self) -> bool {
        matches!(self.state, TaskState::WriteIssued | TaskState::Notified)
    }

    pub fn into_parts(self) -> (Option<Request>, Response) {
        (self.request, self.response)
    }
}

/// 单次请求-响应周期的工作单元。
pub struct ExecutionTask {
    context: ServerContext,
    protocol: Arc<dyn ProtocolAdapter>,
    channel: Arc<dyn Channel>,
    request: Option<Request>,
    response: Response,
    lifecycle: TaskLifecycle,
}

impl ExecutionTask {
    /// 创建任务。
    ///
    /// `request` 为 `None` 表示传输层连请求对象都没能构造，失败已直接写入 `response`。
    pub fn new(
        context: ServerContext,
        protocol: Arc<dyn ProtocolAdapter>,
        channel: Arc<dyn Channel>,
        request: Option<Request>,
        response: Response,
    ) -> Self {
        Self {
            context,
            protocol,
            channel,
            request,
            response,
            lifecycle: TaskLifecycle::new(),
        }
    }

    pub fn state(&self) -> TaskState {
        self.lifecycle.state()
    }

    pub fn channel_id(&self) -> &str {
        self.channel.id()
    }

    pub fn log_id(&self) -> u64 {
        self.request
            .as_ref()
            .map_or(self.response.log_id(), Request::log_id)
    }

    /// 执行完整的请求-响应周期。
    pub fn execute(mut self) -> TaskReport {
        let current = thread::current();
        let attributes = [
            KeyValue::new(keys::THREAD_NAME, current.name().unwrap_or("unnamed")),
            KeyValue::new(keys::LOG_ID, self.log_id()),
            KeyValue::new(keys::CHANNEL_ID, self.channel.id()),
        ];
        self.emit(&LogRecord::new(
            "execution task started",
            LogSeverity::Debug,
            &attributes,
        ));

        self.prepare();
        self.run_chain();

        let Some(bytes) = self.encode() else {
            return self.into_report();
        };

        let completion = self.issue_write(bytes);
        self.notify(completion);
        self.into_report()
    }

    fn prepare(&mut self) {
        match self.request.as_mut() {
            Some(request) => {
                request.bind_channel(Arc::clone(&self.channel));
                if Controller::is_required(request) {
                    let controller = Controller::for_request(request, self.channel.remote_address());
                    request.attach_controller(controller);
                }
                self.response.mirror(request);
                self.enter(TaskState::ControllerBound);
            }
            None => {
                if self.response.exception().is_none() {
                    self.response.set_exception(RpcError::new(
                        codes::REQUEST_MISSING,
                        "task created without a request or a pre-set exception",
                    ));
                }
            }
        }
    }

    fn run_chain(&mut self) {
        if self.response.exception().is_some() {
            self.enter(TaskState::ChainSkipped);
            return;
        }
        let Some(request) = self.request.as_mut() else {
            self.enter(TaskState::ChainSkipped);
            return;
        };

        let chain = &self.context.chain;
        let response = &mut self.response;
        let outcome = catch_unwind(AssertUnwindSafe(|| chain.intercept(request, response)));

        let failure = match outcome {
            Ok(Ok(())) => {
                copy_response_attachments(request, &mut self.response);
                self.enter(TaskState::ChainSucceeded);
                return;
            }
            Ok(Err(err)) => err.into_response_error(),
            Err(payload) => RpcError::new(
                codes::SERVICE_PANICKED,
                format!("interceptor chain panicked: {}", panic_message(payload.as_ref())),
            ),
        };

        self.log_recovered(&failure);
        self.response.set_exception(failure);
        self.enter(TaskState::ChainRecovered);
    }

    fn encode(&mut self) -> Option<bytes::Bytes> {
        let protocol = &self.protocol;
        let request = self.request.as_ref();
        let response = &self.response;
        let encoded = catch_unwind(AssertUnwindSafe(|| protocol.encode_response(request, response)))
            .unwrap_or_else(|payload| Err(EncodingError::Panicked(panic_message(payload.as_ref()))));

        match encoded {
            Ok(bytes) => {
                self.enter(TaskState::Encoded);
                Some(bytes)
            }
            Err(err) => {
                let attributes = self.call_attributes();
                self.emit(
                    &LogRecord::new("send response failed", LogSeverity::Warn, &attributes)
                        .with_error(&err),
                );
                self.enter(TaskState::EncodeFailed);
                None
            }
        }
    }

    fn issue_write(&mut self, bytes: bytes::Bytes) -> WriteCompletion {
        let channel = &self.channel;
        let completion = catch_unwind(AssertUnwindSafe(|| channel.write_async(bytes)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                let attributes = self.call_attributes();
                self.emit(&LogRecord::new(
                    format!("channel write panicked, msg={message}"),
                    LogSeverity::Warn,
                    &attributes,
                ));
                WriteCompletion::ready(Err(TransportError::Io(message)))
            });
        self.enter(TaskState::WriteIssued);
        completion
    }

    fn notify(&mut self, completion: WriteCompletion) {
        let protocol = &self.protocol;
        let request = self.request.as_ref();
        let response = &self.response;
        let notified = catch_unwind(AssertUnwindSafe(|| {
            protocol.after_response_sent(request, response, completion)
        }));
        if let Err(payload) = notified {
            let attributes = self.call_attributes();
            self.emit(&LogRecord::new(
                format!(
                    "after response sent hook panicked, msg={}",
                    panic_message(payload.as_ref())
                ),
                LogSeverity::Warn,
                &attributes,
            ));
        }
        self.enter(TaskState::Notified);
    }

    fn log_recovered(&self, failure: &RpcError) {
        let mut attributes = self.call_attributes();
        attributes.push(KeyValue::new(keys::ERROR_CODE, failure.code()));
        attributes.push(KeyValue::new(keys::ERROR_CATEGORY, failure.category().as_str()));
        let message = format!("invoke method failed, msg={}", failure.message());
        self.emit(&LogRecord::new(message, LogSeverity::Warn, &attributes).with_error(failure));
    }

    fn call_attributes(&self) -> Vec<KeyValue<'static>> {
        let method = self
            .response
            .method_info()
            .map_or_else(|| "unresolved".to_owned(), |method| method.full_name());
        let peer = self
            .channel
            .remote_address()
            .map_or_else(|| "unknown".to_owned(), |addr| addr.to_string());
        vec![
            KeyValue::new(keys::LOG_ID, self.log_id()),
            KeyValue::new(keys::METHOD, method),
            KeyValue::new(keys::PROTOCOL, self.protocol.name()),
            KeyValue::new(keys::PEER_ADDR, peer),
        ]
    }

    fn enter(&mut self, next: TaskState) {
        let advanced = self.lifecycle.advance(next);
        debug_assert!(advanced.is_ok(), "{advanced:?}");
        if let Err(err) = advanced {
            let attributes = [KeyValue::new(keys::TASK_STATE, err.from.as_str())];
            self.emit(
                &LogRecord::new(
                    "execution task state machine violated",
                    LogSeverity::Error,
                    &attributes,
                )
                .with_error(&err),
            );
        }
    }

    /// 提交日志；注入的日志实现 panic 时丢弃该条记录，任务继续执行。
    fn emit(&self, record: &LogRecord<'_>) {
        let logger = &self.context.logger;
        let _ = catch_unwind(AssertUnwindSafe(|| logger.log(record)));
    }

    fn into_report(self) -> TaskReport {
        TaskReport {
            state: self.lifecycle.state(),
            request: self.request,
            response: self.response,
        }
    }
}

/// 把控制器中非空的响应写槽复制进响应。
fn copy_response_attachments(request: &Request, response: &mut Response) {
    let Some(controller) = request.controller() else {
        return;
    };
    if let Some(bytes) = controller.response_binary_attachment()
        && attachment::is_readable(Some(bytes))
    {
        response.set_binary_attachment(bytes.clone());
    }
    if let Some(kv) = controller
        .response_kv_attachment()
        .filter(|kv| !kv.is_empty())
    {
        response.set_kv_attachment(kv.clone());
    }
}

impl fmt::Debug for ExecutionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionTask")
            .field("protocol", &self.protocol.name())
            .field("channel", &self.channel.id())
            .field("state", &self.lifecycle.state())
            .field("request", &self.request)
            .field("response", &self.response)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_forward_only() {
        let mut lifecycle = TaskLifecycle::new();
        assert_eq!(
            lifecycle.advance(TaskState::ControllerBound),
            Ok(StateAdvance::Transition {
                from: TaskState::Created,
                to: TaskState::ControllerBound
            })
        );
        assert_eq!(
            lifecycle.advance(TaskState::ControllerBound),
            Ok(StateAdvance::Noop {
                state: TaskState::ControllerBound
            })
        );
        assert_eq!(
            lifecycle.advance(TaskState::Created),
            Err(IllegalTransition {
                from: TaskState::ControllerBound,
                to: TaskState::Created
            })
        );
        assert_eq!(lifecycle.state(), TaskState::ControllerBound);
    }

    #[test]
    fn encode_failure_is_terminal() {
        let mut lifecycle = TaskLifecycle::new();
        for next in [TaskState::ChainSkipped, TaskState::EncodeFailed] {
            lifecycle.advance(next).expect("legal transition");
        }
        assert!(lifecycle.state().is_terminal());
        assert!(lifecycle.advance(TaskState::WriteIssued).is_err());
    }

    #[test]
    fn write_cannot_precede_encoding() {
        let mut lifecycle = TaskLifecycle::new();
        lifecycle.advance(TaskState::ControllerBound).expect("legal");
        lifecycle.advance(TaskState::ChainSucceeded).expect("legal");
        assert!(lifecycle.advance(TaskState::WriteIssued).is_err());
        assert!(lifecycle.advance(TaskState::ChainRecovered).is_err());
    }
}
