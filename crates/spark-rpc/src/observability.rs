//! 日志能力契约与 `tracing` 桥接。
//!
//! # 教案式概览
//! - **意图（Why）**：执行管线的每个组件都要记录失败，但不应依赖进程级的全局日志单例。
//!   组件在构造时接收 `Arc<dyn Logger>`，测试可以注入记录型实现断言日志内容，生产环境注入
//!   [`TracingLogger`] 把记录转发给 `tracing`。
//! - **逻辑（How）**：
//!   - [`LogRecord`] 打包消息、级别、目标、结构化属性与可选错误，全部以借用形式传递；
//!   - [`Logger::log`] 是唯一必需方法，`debug_with_fields` 等便捷方法在内部构造记录后委托给它；
//!   - [`install_tracing`] 按 [`ServerOptions::log_filter`] 组装 `fmt + EnvFilter` 订阅者。
//! - **契约（What）**：属性键应保持低基数；`Logger` 实现必须是 `Send + Sync`，可能在工作线程与
//!   写完成线程上被并发调用。

use std::{borrow::Cow, error::Error, fmt};

use thiserror::Error as ThisError;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::ServerOptions;

/// 执行管线使用的日志字段键名。
///
/// 键名集中登记在此，记录型 Logger 与告警规则都按这些常量检索。
pub mod keys {
    /// 请求关联 ID。
    pub const LOG_ID: &str = "rpc.log_id";
    /// `service.method` 全名，未解析时为 `unresolved`。
    pub const METHOD: &str = "rpc.method";
    /// 协议适配器名称。
    pub const PROTOCOL: &str = "rpc.protocol";
    /// 连接标识。
    pub const CHANNEL_ID: &str = "net.channel.id";
    /// 对端地址，未知时为 `unknown`。
    pub const PEER_ADDR: &str = "net.peer.addr";
    /// 执行任务的线程名。
    pub const THREAD_NAME: &str = "thread.name";
    /// 稳定错误码。
    pub const ERROR_CODE: &str = "error.code";
    /// 错误分类。
    pub const ERROR_CATEGORY: &str = "error.category";
    /// 任务终态。
    pub const TASK_STATE: &str = "rpc.task.state";
}

/// 日志属性键值对。
#[derive(Clone, Debug, PartialEq)]
pub struct KeyValue<'a> {
    pub key: Cow<'a, str>,
    pub value: AttributeValue<'a>,
}

impl<'a> KeyValue<'a> {
    pub fn new(key: impl Into<Cow<'a, str>>, value: impl Into<AttributeValue<'a>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// 属性值，覆盖文本、布尔与整数三类标量。
///
/// 无符号整数超出 `i64` 范围时饱和转换。
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum AttributeValue<'a> {
    Text(Cow<'a, str>),
    Bool(bool),
    I64(i64),
}

impl fmt::Display for AttributeValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::I64(number) => write!(f, "{number}"),
        }
    }
}

impl<'a> From<&'a str> for AttributeValue<'a> {
    fn from(value: &'a str) -> Self {
        Self::Text(Cow::Borrowed(value))
    }
}

impl From<String> for AttributeValue<'_> {
    fn from(value: String) -> Self {
        Self::Text(Cow::Owned(value))
    }
}

impl<'a> From<Cow<'a, str>> for AttributeValue<'a> {
    fn from(value: Cow<'a, str>) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for AttributeValue<'_> {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue<'_> {
    fn from(value: i64) -> Self {
        Self::I64(value)
    }
}

impl From<u64> for AttributeValue<'_> {
    fn from(value: u64) -> Self {
        Self::I64(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for AttributeValue<'_> {
    fn from(value: usize) -> Self {
        Self::I64(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

/// 日志级别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogSeverity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// 单条结构化日志记录。
///
/// # 契约说明（What）
/// - 记录只持有借用，`Logger::log` 返回后调用方即可释放底层数据；
/// - 需要延迟输出的实现（例如测试中的记录型 Logger）必须自行复制所需字段。
#[derive(Debug)]
pub struct LogRecord<'a> {
    pub message: Cow<'a, str>,
    pub severity: LogSeverity,
    pub target: Option<&'a str>,
    pub error: Option<&'a (dyn Error + 'static)>,
    pub attributes: &'a [KeyValue<'a>],
}

impl<'a> LogRecord<'a> {
    pub fn new(
        message: impl Into<Cow<'a, str>>,
        severity: LogSeverity,
        attributes: &'a [KeyValue<'a>],
    ) -> Self {
        Self {
            message: message.into(),
            severity,
            target: None,
            error: None,
            attributes,
        }
    }

    pub fn with_target(mut self, target: &'a str) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_error(mut self, error: &'a (dyn Error + 'static)) -> Self {
        self.error = Some(error);
        self
    }

    /// 按键查找属性。
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue<'a>> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| &attr.value)
    }
}

/// 注入式日志能力。
///
/// # 教案级说明
/// - **意图（Why）**：替代进程级可变单例，组件只依赖这一抽象；
/// - **逻辑（How）**：`log` 为唯一必需方法，其余便捷方法构造 [`LogRecord`] 后委托给它；
/// - **契约（What）**：实现应尽量非阻塞，且必须允许从任意线程并发调用。
pub trait Logger: Send + Sync + 'static {
    /// 提交结构化日志。
    fn log(&self, record: &LogRecord<'_>);

    fn debug_with_fields(&self, message: &str, attributes: &[KeyValue<'_>]) {
        self.log(&LogRecord::new(message, LogSeverity::Debug, attributes));
    }

    fn info_with_fields(&self, message: &str, attributes: &[KeyValue<'_>]) {
        self.log(&LogRecord::new(message, LogSeverity::Info, attributes));
    }

    fn warn_with_fields(&self, message: &str, attributes: &[KeyValue<'_>]) {
        self.log(&LogRecord::new(message, LogSeverity::Warn, attributes));
    }

    fn error_with_fields(
        &self,
        message: &str,
        error: Option<&(dyn Error + 'static)>,
        attributes: &[KeyValue<'_>],
    ) {
        let mut record = LogRecord::new(message, LogSeverity::Error, attributes);
        record.error = error;
        self.log(&record);
    }
}

/// 把 [`LogRecord`] 转发为 `tracing` 事件。
///
/// `tracing` 的字段名必须在编译期确定，因此结构化属性被渲染为单个 `attributes` 字段，
/// 记录的目标写入 `log.target` 字段。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Self {
        Self
    }
}

impl Logger for TracingLogger {
    fn log(&self, record: &LogRecord<'_>) {
        let attributes = render_attributes(record.attributes);
        let target = record.target.unwrap_or("spark_rpc");
        let error = record.error.map(|err| err.to_string());
        let message = record.message.as_ref();

        macro_rules! emit {
            ($level:expr) => {
                tracing::event!(
                    target: "spark_rpc",
                    $level,
                    log.target = target,
                    attributes = %attributes,
                    error = error.as_deref(),
                    "{}",
                    message
                )
            };
        }

        match record.severity {
            LogSeverity::Trace => emit!(Level::TRACE),
            LogSeverity::Debug => emit!(Level::DEBUG),
            LogSeverity::Info => emit!(Level::INFO),
            LogSeverity::Warn => emit!(Level::WARN),
            LogSeverity::Error => emit!(Level::ERROR),
        }
    }
}

fn render_attributes(attributes: &[KeyValue<'_>]) -> String {
    attributes
        .iter()
        .map(|attr| format!("{}={}", attr.key, attr.value))
        .collect::<Vec<_>>()
        .join(" ")
}

/// 安装全局 `tracing` 订阅者时的失败。
#[derive(Debug, ThisError)]
pub enum TracingInstallError {
    #[error("invalid log filter `{filter}`: {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet(#[source] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装 `fmt + EnvFilter` 全局订阅者。
///
/// # 教案式说明
/// - **逻辑（How）**：`RUST_LOG` 存在时优先使用环境变量，否则使用 [`ServerOptions::log_filter`]；
/// - **契约（What）**：进程内只能成功调用一次，外部已设置订阅者时返回
///   [`TracingInstallError::SubscriberAlreadySet`]。
pub fn install_tracing(options: &ServerOptions) -> Result<(), TracingInstallError> {
    let filter = build_env_filter(options.log_filter())?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(TracingInstallError::SubscriberAlreadySet)
}

fn build_env_filter(configured: &str) -> Result<EnvFilter, TracingInstallError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => {
            EnvFilter::try_new(configured).map_err(|err| TracingInstallError::InvalidFilter {
                filter: configured.to_owned(),
                reason: err.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::error::RpcError;

    #[test]
    fn record_looks_up_attributes() {
        let attrs = [
            KeyValue::new("rpc.log_id", 7_u64),
            KeyValue::new("rpc.method", "Echo.echo"),
        ];
        let record = LogRecord::new("x", LogSeverity::Info, &attrs);
        assert_eq!(record.attribute("rpc.log_id"), Some(&AttributeValue::I64(7)));
        assert!(record.attribute("missing").is_none());
    }

    #[test]
    fn unsigned_values_saturate() {
        assert_eq!(AttributeValue::from(u64::MAX), AttributeValue::I64(i64::MAX));
    }

    #[test]
    #[traced_test]
    fn tracing_logger_emits_events() {
        let logger = TracingLogger::new();
        let err = RpcError::service("db down");
        logger.warn_with_fields(
            "invoke method failed, msg=db down",
            &[KeyValue::new("rpc.log_id", 11_u64)],
        );
        logger.error_with_fields("send response failed", Some(&err), &[]);

        assert!(logs_contain("invoke method failed, msg=db down"));
        assert!(logs_contain("rpc.log_id=11"));
        assert!(logs_contain("[rpc.service.failed] db down"));
    }

    #[test]
    fn invalid_filter_is_reported() {
        // 仅在未设置 RUST_LOG 时才会走到配置值。
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let err = build_env_filter("spark_rpc=loud").expect_err("level is not valid");
        assert!(matches!(err, TracingInstallError::InvalidFilter { .. }));
    }
}
