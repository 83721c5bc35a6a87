//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为执行管线的每一个失败阶段提供集中定义：预先存在的解码/路由失败、业务方法失败、
//!   拦截器拒绝、编码失败与传输失败；
//! - 让“可回收失败”（写入 `Response.exception` 并回传客户端）与“终止性失败”（编码失败，
//!   不产生任何回写）在类型上即可区分。
//!
//! ## 设计要求（What）
//! - [`RpcError`] 是客户端可见的错误形态，携带稳定错误码、描述与可选底层原因；
//! - [`InterceptError`]、[`EncodingError`]、[`TransportError`] 以 `thiserror` 派生，兼容
//!   `std::error::Error` 生态；
//! - 错误码遵循 `rpc.<域>.<语义>` 约定，集中登记在 [`codes`] 中。

use std::{borrow::Cow, error::Error, fmt};

use thiserror::Error as ThisError;

use crate::message::CompressType;

/// 错误底层原因的统一装箱形态。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// 稳定错误码集合。
///
/// # 契约说明（What）
/// - 码值一经发布不得修改语义；新增码值需同步更新 [`ErrorCategory::of_code`] 的映射。
pub mod codes {
    /// 传输层在解码阶段已经失败。
    pub const DECODE_FAILED: &str = "rpc.request.decode_failed";
    /// 任务既没有请求对象也没有预置异常。
    pub const REQUEST_MISSING: &str = "rpc.request.missing";
    /// 路由阶段未找到目标方法。
    pub const METHOD_NOT_FOUND: &str = "rpc.route.method_not_found";
    /// 请求到达执行管线时仍未绑定方法描述。
    pub const METHOD_UNRESOLVED: &str = "rpc.route.unresolved";
    /// 业务方法返回的通用失败。
    pub const SERVICE_FAILED: &str = "rpc.service.failed";
    /// 动态调用失败但未捕获到具体原因。
    pub const INVOCATION_FAILED: &str = "rpc.service.invocation_failed";
    /// 拦截器链或业务方法发生 panic。
    pub const SERVICE_PANICKED: &str = "rpc.service.panicked";
    /// 拦截器基于策略拒绝了本次调用。
    pub const INTERCEPTOR_REJECTED: &str = "rpc.interceptor.rejected";
    /// 执行器拒绝接收任务（例如已关闭）。
    pub const EXECUTOR_REJECTED: &str = "rpc.executor.rejected";
}

/// 错误分类，驱动日志与客户端渲染策略。
///
/// - `Decode`/`Routing`：请求尚未抵达业务逻辑；
/// - `Service`：业务方法自身失败；
/// - `Policy`：拦截器拒绝；
/// - `Internal`：框架内部异常。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCategory {
    Decode,
    Routing,
    Service,
    Policy,
    Internal,
}

impl ErrorCategory {
    /// 根据错误码查表得到默认分类，未登记的码值回退为 `Service`。
    pub fn of_code(code: &str) -> Self {
        match code {
            codes::DECODE_FAILED | codes::REQUEST_MISSING => Self::Decode,
            codes::METHOD_NOT_FOUND | codes::METHOD_UNRESOLVED => Self::Routing,
            codes::INTERCEPTOR_REJECTED => Self::Policy,
            codes::EXECUTOR_REJECTED => Self::Internal,
            _ => Self::Service,
        }
    }

    /// 返回低基数的分类标签，供日志属性使用。
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Routing => "routing",
            Self::Service => "service",
            Self::Policy => "policy",
            Self::Internal => "internal",
        }
    }
}

/// `RpcError` 是执行管线中客户端可见的错误形态。
///
/// # 设计背景（Why）
/// - 请求在解码、路由、拦截器与业务方法任一阶段失败，都需要合流为同一种可编码的错误对象，
///   由协议适配器决定如何渲染到线上；
/// - `Request.exception` 与 `Response.exception` 以 `Arc<RpcError>` 共享，镜像时复制指针而非内容，
///   保证客户端看到的正是传输层记录的那个错误。
///
/// # 契约说明（What）
/// - `code`：稳定错误码，建议取自 [`codes`]；
/// - `message`：人类可读描述，不应包含敏感信息；
/// - `cause`：可选底层原因，通过 [`Error::source`] 暴露；
/// - `category`：未显式设置时由 [`ErrorCategory::of_code`] 推导。
///
/// # 风险提示（Trade-offs）
/// - 底层原因以 `Box<dyn Error>` 保存，因此 `RpcError` 不可 `Clone`；需要共享时请包裹 `Arc`。
#[derive(Debug)]
pub struct RpcError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

impl RpcError {
    /// 构造错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// 以 [`codes::SERVICE_FAILED`] 构造业务失败，业务方法最常用的入口。
    pub fn service(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::SERVICE_FAILED, message)
    }

    /// 以 [`codes::INTERCEPTOR_REJECTED`] 构造策略拒绝。
    pub fn rejected(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::INTERCEPTOR_REJECTED, message)
    }

    /// 附带底层原因。
    pub fn with_cause(mut self, cause: impl Into<ErrorCause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// 覆盖默认分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 底层原因。
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// 错误分类；显式设置优先，否则按错误码查表。
    pub fn category(&self) -> ErrorCategory {
        self.category
            .unwrap_or_else(|| ErrorCategory::of_code(self.code))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for RpcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn Error + 'static))
    }
}

/// 动态调用业务方法时的包装失败。
///
/// # 教案式说明
/// - **意图（Why）**：业务方法经由 [`Invocable`](crate::interceptor::Invocable) 被动态调用，
///   调用层会把方法自身的失败包裹在这一层里。任务边界需要剥掉包装，只把真正的原因交给客户端，
///   避免把分派层的内部类型泄露到线上。
/// - **契约（What）**：
///   - `target`：业务方法真正抛出的错误，可能缺失；
///   - [`into_cause`](Self::into_cause)：存在 `target` 时原样返回；缺失时退化为以包装自身描述
///     构造的 [`codes::INVOCATION_FAILED`] 错误。
#[derive(Debug)]
pub struct InvocationFailure {
    target: Option<RpcError>,
    context: Cow<'static, str>,
}

impl InvocationFailure {
    /// 以业务方法抛出的原因构造。
    pub fn new(target: RpcError) -> Self {
        Self {
            target: Some(target),
            context: Cow::Borrowed("invocation target failed"),
        }
    }

    /// 构造未捕获到目标原因的失败，`context` 描述调用层观察到的现象。
    pub fn without_target(context: impl Into<Cow<'static, str>>) -> Self {
        Self {
            target: None,
            context: context.into(),
        }
    }

    /// 业务方法抛出的原因。
    pub fn target(&self) -> Option<&RpcError> {
        self.target.as_ref()
    }

    /// 剥离包装，返回应写入响应的错误。
    pub fn into_cause(self) -> RpcError {
        match self.target {
            Some(target) => target,
            None => RpcError::new(codes::INVOCATION_FAILED, self.context),
        }
    }
}

impl fmt::Display for InvocationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}: {}", self.context, target),
            None => f.write_str(&self.context),
        }
    }
}

impl Error for InvocationFailure {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.target.as_ref().map(|target| target as &(dyn Error + 'static))
    }
}

impl From<RpcError> for InvocationFailure {
    fn from(value: RpcError) -> Self {
        Self::new(value)
    }
}

/// 拦截器链向外传播的失败。
///
/// - `Invocation`：终端环节调用业务方法失败，任务边界会剥离包装；
/// - `Chain`：拦截器自身抛出的失败（如鉴权拒绝），任务边界原样记录。
#[derive(Debug, ThisError)]
pub enum InterceptError {
    #[error("invoke method failed: {0}")]
    Invocation(#[from] InvocationFailure),
    #[error(transparent)]
    Chain(#[from] RpcError),
}

impl InterceptError {
    /// 按任务边界的分类规则还原为应写入响应的错误。
    pub fn into_response_error(self) -> RpcError {
        match self {
            Self::Invocation(failure) => failure.into_cause(),
            Self::Chain(error) => error,
        }
    }
}

/// 协议适配器无法把响应编码为线上字节。
///
/// 编码失败是执行管线中唯一不回写任何字节的失败路径。
#[derive(Debug, ThisError)]
pub enum EncodingError {
    #[error("protocol `{protocol}` does not support compression {compress:?}")]
    UnsupportedCompression {
        protocol: &'static str,
        compress: CompressType,
    },
    #[error("encoded response of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("response exception cannot be rendered: {0}")]
    UnencodableException(String),
    #[error("response body cannot be serialized: {0}")]
    Serialize(String),
    #[error("encoder panicked: {0}")]
    Panicked(String),
}

/// 异步写出的失败结果，由写完成句柄携带。
///
/// 需要在多个监听者之间分发，因此实现 `Clone`，底层 IO 错误以文本保存。
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum TransportError {
    #[error("channel is closed")]
    Closed,
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("write promise dropped before completion")]
    Abandoned,
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// 把 panic 载荷转换为可读文本。
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
