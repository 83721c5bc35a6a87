//! 测试桩集合：日志、连接与协议适配器的最小实现。
//!
//! # 设计定位（Why）
//! - 执行管线的每个测试都需要满足 `Logger`、`Channel`、`ProtocolAdapter` 三个契约；集中提供桩对象，
//!   接口调整时只需改动一处；
//! - 记录型实现把调用痕迹保存下来，测试可以直接断言“写出几次、通知几次、记了什么日志”。
//!
//! # 契约说明（What）
//! - 桩对象仅用于测试与示例，全部线程安全，可在工作线程与完成线程间共享；
//! - [`RecordingChannel`] 默认在 `write_async` 内同步完成写出；`manual` 模式下由测试调用
//!   [`RecordingChannel::complete_next`] 决定完成时机与结果。

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    channel::{Channel, WriteCompletion, WritePromise, WriteResult, write_completion},
    error::{EncodingError, TransportError},
    message::{Request, Response},
    observability::{LogRecord, LogSeverity, Logger},
    protocol::ProtocolAdapter,
};

/// 丢弃一切日志。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _record: &LogRecord<'_>) {}
}

/// 获取共享的 [`NoopLogger`]。
pub fn noop_logger() -> Arc<dyn Logger> {
    Arc::new(NoopLogger)
}

/// 拥有所有权的日志快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedLog {
    pub severity: LogSeverity,
    pub message: String,
    pub attributes: Vec<(String, String)>,
    pub error: Option<String>,
}

impl RecordedLog {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

/// 记录全部日志的 Logger。
#[derive(Debug, Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<RecordedLog>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RecordedLog> {
        self.records.lock().clone()
    }

    /// 指定级别的日志。
    pub fn at(&self, severity: LogSeverity) -> Vec<RecordedLog> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.severity == severity)
            .cloned()
            .collect()
    }

    /// 是否存在指定级别且消息包含 `needle` 的日志。
    pub fn contains(&self, severity: LogSeverity, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|record| record.severity == severity && record.message.contains(needle))
    }
}

impl Logger for RecordingLogger {
    fn log(&self, record: &LogRecord<'_>) {
        let snapshot = RecordedLog {
            severity: record.severity,
            message: record.message.to_string(),
            attributes: record
                .attributes
                .iter()
                .map(|attr| (attr.key.to_string(), attr.value.to_string()))
                .collect(),
            error: record.error.map(|err| err.to_string()),
        };
        self.records.lock().push(snapshot);
    }
}

/// 记录写出的连接桩。
#[derive(Debug)]
pub struct RecordingChannel {
    id: String,
    remote: Option<SocketAddr>,
    auto_complete: bool,
    writes: Mutex<Vec<Bytes>>,
    pending: Mutex<Vec<WritePromise>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl RecordingChannel {
    /// 写出立即成功的连接。
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            remote: None,
            auto_complete: true,
            writes: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// 写出保持挂起，直到测试调用 [`complete_next`](Self::complete_next)。
    pub fn manual(id: impl Into<String>) -> Self {
        Self {
            auto_complete: false,
            ..Self::new(id)
        }
    }

    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn writes(&self) -> Vec<Bytes> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    /// 以给定结果完成最早挂起的写出；没有挂起写出时返回 `false`。
    pub fn complete_next(&self, result: WriteResult) -> bool {
        let promise = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        promise.complete(result);
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl Channel for RecordingChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn write_async(&self, bytes: Bytes) -> WriteCompletion {
        if self.closed.load(Ordering::SeqCst) {
            return WriteCompletion::ready(Err(TransportError::Closed));
        }
        self.writes.lock().push(bytes);
        let (promise, completion) = write_completion();
        if self.auto_complete {
            promise.succeed();
        } else {
            self.pending.lock().push(promise);
        }
        completion
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// 记录编码与通知次数的协议桩。
///
/// 编码结果为 `"<log_id>|<错误码或 ok>"` 的文本，便于断言线上内容。
#[derive(Debug, Default)]
pub struct RecordingProtocol {
    fail_encode: bool,
    panic_on_notify: bool,
    encodes: AtomicUsize,
    notifications: AtomicUsize,
    completions: Mutex<Vec<WriteCompletion>>,
}

impl RecordingProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次编码都以 [`EncodingError::UnsupportedCompression`] 失败。
    pub fn failing_encode() -> Self {
        Self {
            fail_encode: true,
            ..Self::default()
        }
    }

    /// 通知钩子内部 panic。
    pub fn panicking_notify() -> Self {
        Self {
            panic_on_notify: true,
            ..Self::default()
        }
    }

    pub fn encodes(&self) -> usize {
        self.encodes.load(Ordering::SeqCst)
    }

    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }

    /// 通知钩子收到的写完成句柄。
    pub fn completions(&self) -> Vec<WriteCompletion> {
        self.completions.lock().clone()
    }

    /// 渲染响应的线上文本。
    pub fn render(response: &Response) -> String {
        let status = response
            .exception()
            .map_or("ok", |exception| exception.code());
        format!("{}|{}", response.log_id(), status)
    }
}

impl ProtocolAdapter for RecordingProtocol {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn encode_response(
        &self,
        _request: Option<&Request>,
        response: &Response,
    ) -> Result<Bytes, EncodingError> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        if self.fail_encode {
            return Err(EncodingError::UnsupportedCompression {
                protocol: "recording",
                compress: response.compress_type(),
            });
        }
        Ok(Bytes::from(Self::render(response)))
    }

    fn after_response_sent(
        &self,
        _request: Option<&Request>,
        _response: &Response,
        completion: WriteCompletion,
    ) {
        self.notifications.fetch_add(1, Ordering::SeqCst);
        self.completions.lock().push(completion);
        if self.panic_on_notify {
            panic!("post-send bookkeeping bug");
        }
    }
}
