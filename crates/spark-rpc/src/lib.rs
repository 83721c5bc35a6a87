#![deny(unsafe_code)]
#![doc = "spark-rpc: 协议无关的 RPC 服务端请求执行管线。"]
#![doc = ""]
#![doc = "一个已解码的 [`Request`] 经由 [`ExecutionTask`] 依次完成控制器装配、拦截器链调用、失败回收、"]
#![doc = "协议编码与异步回写；传输层、方法解析与具体线上格式都以契约形式接入。"]

pub mod attachment;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod interceptor;
pub mod message;
pub mod observability;
pub mod protocol;
pub mod server;
pub mod task;
pub mod test_stubs;

pub use attachment::KvAttachment;
pub use channel::{Channel, WriteCompletion, WritePromise, WriteResult, write_completion};
pub use config::{ConfigError, ServerOptions};
pub use controller::Controller;
pub use error::{
    EncodingError, ErrorCategory, InterceptError, InvocationFailure, RpcError, TransportError,
    codes,
};
pub use executor::{InlineExecutor, TaskExecutor};
pub use interceptor::{
    FnInvocable, Interceptor, InterceptorChain, InterceptorDescriptor, Invocable, Invocation, Next,
};
pub use message::{Body, CompressType, MethodInfo, Request, Response};
pub use observability::{
    KeyValue, LogRecord, LogSeverity, Logger, TracingLogger, install_tracing,
};
pub use protocol::{ProtocolAdapter, close_when_sent};
pub use server::{RpcServer, RpcServerBuilder};
pub use task::{ExecutionTask, ServerContext, StateAdvance, TaskLifecycle, TaskReport, TaskState};
