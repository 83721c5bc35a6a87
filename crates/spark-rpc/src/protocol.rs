//! 协议适配器契约：执行管线与具体线上格式之间的可插拔边界。
//!
//! # 教案式概览
//! - **意图（Why）**：多种协议族共享同一条执行管线，管线只需要“把响应编码成字节”和
//!   “字节已发出后通知协议做簿记”两个能力；
//! - **契约（What）**：
//!   - [`ProtocolAdapter::encode_response`] 对任务而言是纯函数，不得修改请求与响应；
//!     无法编码时返回 [`EncodingError`]，任务随即终止且不回写任何字节；
//!   - [`ProtocolAdapter::after_response_sent`] 在写出**发起**之后调用，而不是确认落盘之后；
//!     写出的真实结果以 [`WriteCompletion`] 为准。该钩子不得阻塞，需容忍写出随后失败或
//!     与同一连接上其他调用乱序完成；通过 `on_complete` 挂接的逻辑运行在完成线程上，
//!     触碰的连接级状态必须自行同步；
//! - **风险（Trade-offs）**：异常对象本身无法序列化时同样归入编码失败，客户端这一轮收不到响应。

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    channel::{Channel, WriteCompletion},
    error::EncodingError,
    message::{Request, Response},
};

/// 协议适配器。
///
/// 请求参数为 `Option<&Request>`：传输层在连请求对象都无法构造时，会直接以预置异常的响应
/// 创建任务，此时编码与通知都只能看到响应。
pub trait ProtocolAdapter: Send + Sync + 'static {
    /// 协议名称，用于日志。
    fn name(&self) -> &'static str;

    /// 把响应编码为线上字节。
    fn encode_response(
        &self,
        request: Option<&Request>,
        response: &Response,
    ) -> Result<Bytes, EncodingError>;

    /// 写出发起后的簿记钩子。
    fn after_response_sent(
        &self,
        request: Option<&Request>,
        response: &Response,
        completion: WriteCompletion,
    );
}

/// 写出完成后关闭连接，供不保持长连接的协议在 `after_response_sent` 中使用。
///
/// 无论写出成功与否都会关闭；关闭在完成线程上执行。
pub fn close_when_sent(channel: &Arc<dyn Channel>, completion: &WriteCompletion) {
    let channel = Arc::clone(channel);
    completion.on_complete(move |_| channel.close());
}
