//! 请求与响应的数据模型。
//!
//! # 教案式概览
//! - **意图（Why）**：传输层把字节解码成 [`Request`] 后交给执行任务，任务在同一个调用周期内
//!   产出 [`Response`] 再交给协议适配器编码。两者需要承载关联 ID、压缩类型、方法描述、附件
//!   与异常，且与具体线上格式无关。
//! - **所有权（How）**：`Request` 在交给任务之前归传输层所有，之后由任务独占；`Response` 始终由
//!   任务独占。方法描述 [`MethodInfo`] 由方法解析阶段产出，以 `Arc` 在请求与响应间共享且不可变。
//! - **契约（What）**：
//!   - 主体参数与返回值以类型擦除的 [`Body`] 传递，由协议编解码与业务方法约定具体类型；
//!   - `channel` 由任务在处理前绑定一次，此后不再改变；
//!   - `controller` 仅在需要时由任务创建（见 [`Controller::is_required`]）。

use std::{any::Any, borrow::Cow, fmt, sync::Arc};

use bytes::Bytes;

use crate::{
    attachment::KvAttachment,
    channel::Channel,
    controller::Controller,
    error::RpcError,
    interceptor::Invocable,
};

/// 类型擦除的请求参数或响应结果。
pub type Body = Box<dyn Any + Send>;

/// 主体压缩类型。
///
/// 码值与线上协议字段一致，未知码值通过 [`TryFrom<i32>`] 报告。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CompressType {
    #[default]
    None = 0,
    Snappy = 1,
    Gzip = 2,
    Zlib = 3,
    Lz4 = 4,
}

impl CompressType {
    pub const ALL: [CompressType; 5] = [
        CompressType::None,
        CompressType::Snappy,
        CompressType::Gzip,
        CompressType::Zlib,
        CompressType::Lz4,
    ];

    /// 线上码值。
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for CompressType {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|compress| compress.code() == value)
            .ok_or(value)
    }
}

/// 已解析的业务方法描述。
///
/// # 契约说明（What）
/// - `service_name`/`method_name`：用于日志与协议渲染；
/// - `includes_controller`：方法签名是否需要注入 [`Controller`]；
/// - `invocable`：绑定到该方法的调用能力，拦截器链的终端环节通过它调用业务逻辑。
///
/// 描述在一次调用内不可变，并由方法解析阶段在任务创建前绑定到请求。
pub struct MethodInfo {
    service_name: Cow<'static, str>,
    method_name: Cow<'static, str>,
    includes_controller: bool,
    invocable: Arc<dyn Invocable>,
}

impl MethodInfo {
    pub fn new(
        service_name: impl Into<Cow<'static, str>>,
        method_name: impl Into<Cow<'static, str>>,
        invocable: impl Invocable,
    ) -> Self {
        Self::with_shared_invocable(service_name, method_name, Arc::new(invocable))
    }

    /// 复用已有的 `Arc<dyn Invocable>` 构造描述，适合同一实现挂载到多个方法名。
    pub fn with_shared_invocable(
        service_name: impl Into<Cow<'static, str>>,
        method_name: impl Into<Cow<'static, str>>,
        invocable: Arc<dyn Invocable>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
            includes_controller: false,
            invocable,
        }
    }

    /// 声明方法签名需要控制器。
    pub fn with_controller(mut self, includes_controller: bool) -> Self {
        self.includes_controller = includes_controller;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    /// `service.method` 形式的全名。
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.service_name, self.method_name)
    }

    pub fn includes_controller(&self) -> bool {
        self.includes_controller
    }

    pub fn invocable(&self) -> &Arc<dyn Invocable> {
        &self.invocable
    }
}

impl fmt::Debug for MethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInfo")
            .field("service_name", &self.service_name)
            .field("method_name", &self.method_name)
            .field("includes_controller", &self.includes_controller)
            .finish_non_exhaustive()
    }
}

/// 传输层解码得到的入站请求。
pub struct Request {
    log_id: u64,
    method_info: Option<Arc<MethodInfo>>,
    args: Option<Body>,
    binary_attachment: Option<Bytes>,
    kv_attachment: Option<KvAttachment>,
    compress_type: CompressType,
    exception: Option<Arc<RpcError>>,
    channel: Option<Arc<dyn Channel>>,
    controller: Option<Controller>,
}

impl Request {
    /// 以关联 ID 与已解析方法构造请求。
    pub fn new(log_id: u64, method_info: Arc<MethodInfo>) -> Self {
        Self {
            method_info: Some(method_info),
            ..Self::unresolved(log_id)
        }
    }

    /// 构造尚未绑定方法的请求，常见于路由失败后仍需回写错误的场景。
    pub fn unresolved(log_id: u64) -> Self {
        Self {
            log_id,
            method_info: None,
            args: None,
            binary_attachment: None,
            kv_attachment: None,
            compress_type: CompressType::None,
            exception: None,
            channel: None,
            controller: None,
        }
    }

    pub fn with_args(mut self, args: impl Any + Send) -> Self {
        self.args = Some(Box::new(args));
        self
    }

    pub fn with_binary_attachment(mut self, attachment: impl Into<Bytes>) -> Self {
        self.binary_attachment = Some(attachment.into());
        self
    }

    pub fn with_kv_attachment(mut self, attachment: KvAttachment) -> Self {
        self.kv_attachment = Some(attachment);
        self
    }

    pub fn with_compress_type(mut self, compress_type: CompressType) -> Self {
        self.compress_type = compress_type;
        self
    }

    /// 记录传输层在解码/路由阶段已经发生的失败；设置后业务逻辑不会执行。
    pub fn with_exception(mut self, exception: impl Into<Arc<RpcError>>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    pub fn log_id(&self) -> u64 {
        self.log_id
    }

    pub fn method_info(&self) -> Option<&Arc<MethodInfo>> {
        self.method_info.as_ref()
    }

    /// 请求参数的只读视图；终端环节取走参数后为 `None`。
    pub fn args(&self) -> Option<&Body> {
        self.args.as_ref()
    }

    /// 取走请求参数。
    pub fn take_args(&mut self) -> Option<Body> {
        self.args.take()
    }

    pub fn binary_attachment(&self) -> Option<&Bytes> {
        self.binary_attachment.as_ref()
    }

    pub fn kv_attachment(&self) -> Option<&KvAttachment> {
        self.kv_attachment.as_ref()
    }

    pub fn compress_type(&self) -> CompressType {
        self.compress_type
    }

    pub fn exception(&self) -> Option<&Arc<RpcError>> {
        self.exception.as_ref()
    }

    /// 所属连接；任务开始处理前为 `None`。
    pub fn channel(&self) -> Option<&Arc<dyn Channel>> {
        self.channel.as_ref()
    }

    pub fn controller(&self) -> Option<&Controller> {
        self.controller.as_ref()
    }

    pub fn controller_mut(&mut self) -> Option<&mut Controller> {
        self.controller.as_mut()
    }

    /// 绑定所属连接，只在首次调用时生效。
    pub(crate) fn bind_channel(&mut self, channel: Arc<dyn Channel>) {
        debug_assert!(self.channel.is_none(), "request channel is bound once");
        self.channel.get_or_insert(channel);
    }

    pub(crate) fn attach_controller(&mut self, controller: Controller) {
        debug_assert!(self.controller.is_none(), "one controller per call");
        self.controller.get_or_insert(controller);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("log_id", &self.log_id)
            .field("method_info", &self.method_info)
            .field("has_args", &self.args.is_some())
            .field("binary_attachment", &self.binary_attachment)
            .field("kv_attachment", &self.kv_attachment)
            .field("compress_type", &self.compress_type)
            .field("exception", &self.exception)
            .field("channel", &self.channel.as_ref().map(|channel| channel.id()))
            .field("controller", &self.controller)
            .finish()
    }
}

/// 出站响应，由执行任务填充后交给协议适配器编码。
#[derive(Default)]
pub struct Response {
    log_id: u64,
    compress_type: CompressType,
    method_info: Option<Arc<MethodInfo>>,
    exception: Option<Arc<RpcError>>,
    result: Option<Body>,
    binary_attachment: Option<Bytes>,
    kv_attachment: Option<KvAttachment>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// 构造已携带失败的响应，用于传输层在连请求对象都无法构造时直接回写错误。
    pub fn failed(log_id: u64, exception: impl Into<Arc<RpcError>>) -> Self {
        Self {
            log_id,
            exception: Some(exception.into()),
            ..Self::default()
        }
    }

    pub fn log_id(&self) -> u64 {
        self.log_id
    }

    pub fn compress_type(&self) -> CompressType {
        self.compress_type
    }

    pub fn method_info(&self) -> Option<&Arc<MethodInfo>> {
        self.method_info.as_ref()
    }

    pub fn exception(&self) -> Option<&Arc<RpcError>> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, exception: impl Into<Arc<RpcError>>) {
        self.exception = Some(exception.into());
    }

    pub fn result(&self) -> Option<&Body> {
        self.result.as_ref()
    }

    /// 按具体类型读取结果。
    pub fn result_as<T: Any>(&self) -> Option<&T> {
        self.result.as_ref().and_then(|body| body.downcast_ref())
    }

    pub fn set_result(&mut self, result: Option<Body>) {
        self.result = result;
    }

    pub fn take_result(&mut self) -> Option<Body> {
        self.result.take()
    }

    pub fn binary_attachment(&self) -> Option<&Bytes> {
        self.binary_attachment.as_ref()
    }

    pub fn set_binary_attachment(&mut self, attachment: impl Into<Bytes>) {
        self.binary_attachment = Some(attachment.into());
    }

    pub fn kv_attachment(&self) -> Option<&KvAttachment> {
        self.kv_attachment.as_ref()
    }

    pub fn set_kv_attachment(&mut self, attachment: KvAttachment) {
        self.kv_attachment = Some(attachment);
    }

    /// 从请求镜像关联 ID、压缩类型、方法描述与异常。
    ///
    /// 在任何调用发生之前执行，保证客户端即使在失败路径上也能看到一致的关联 ID 与压缩类型。
    pub(crate) fn mirror(&mut self, request: &Request) {
        self.log_id = request.log_id;
        self.compress_type = request.compress_type;
        self.method_info = request.method_info.clone();
        self.exception = request.exception.clone();
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("log_id", &self.log_id)
            .field("compress_type", &self.compress_type)
            .field("method_info", &self.method_info)
            .field("exception", &self.exception)
            .field("has_result", &self.result.is_some())
            .field("binary_attachment", &self.binary_attachment)
            .field("kv_attachment", &self.kv_attachment)
            .finish()
    }
}
