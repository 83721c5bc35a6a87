//! 按需创建的单次调用上下文。
//!
//! - **意图（Why）**：附件与对端地址只在业务方法需要时才暴露，普通调用不付出额外分配；
//! - **契约（What）**：方法声明需要控制器，或请求携带任一附件时才创建；业务写入的响应附件
//!   由执行任务在拦截器链成功后复制进响应。

use std::net::SocketAddr;

use bytes::Bytes;

use crate::{attachment::KvAttachment, message::Request};

/// 单次调用的上下文，向业务逻辑暴露请求附件、对端地址与响应附件写槽。
///
/// # 教案级说明
///
/// ## 意图 (Why)
/// - 业务方法需要读取带外附件或对端身份时，不应直接依赖传输层或协议实现；
/// - 只有确有需要的调用才创建控制器，不读附件、不关心对端的方法不承担这次分配。
///
/// ## 契约 (What)
/// - 由执行任务在调用开始前按需创建：方法声明需要控制器，或请求携带任一附件；
/// - 请求附件为只读副本；`response_binary_attachment` 与 `response_kv_attachment` 是业务可写的
///   两个写槽，任务在拦截器链成功返回后把非空写槽复制进响应；
/// - 生命周期限定在一个任务之内，从不跨调用或跨线程共享。
///
/// ## 注意事项 (Trade-offs)
/// - 二进制附件以 [`Bytes`] 保存，复制只增加引用计数，不拷贝负载。
#[derive(Clone, Debug, Default)]
pub struct Controller {
    request_binary_attachment: Option<Bytes>,
    request_kv_attachment: Option<KvAttachment>,
    remote_address: Option<SocketAddr>,
    response_binary_attachment: Option<Bytes>,
    response_kv_attachment: Option<KvAttachment>,
}

impl Controller {
    /// 判断给定请求是否需要控制器。
    ///
    /// 当且仅当方法声明需要控制器，或请求携带二进制/键值附件之一时返回 `true`。
    pub fn is_required(request: &Request) -> bool {
        request
            .method_info()
            .is_some_and(|method| method.includes_controller())
            || request.binary_attachment().is_some()
            || request.kv_attachment().is_some()
    }

    /// 从请求附件与对端地址构造控制器。
    pub(crate) fn for_request(request: &Request, remote_address: Option<SocketAddr>) -> Self {
        Self {
            request_binary_attachment: request.binary_attachment().cloned(),
            request_kv_attachment: request.kv_attachment().cloned(),
            remote_address,
            response_binary_attachment: None,
            response_kv_attachment: None,
        }
    }

    pub fn request_binary_attachment(&self) -> Option<&Bytes> {
        self.request_binary_attachment.as_ref()
    }

    pub fn request_kv_attachment(&self) -> Option<&KvAttachment> {
        self.request_kv_attachment.as_ref()
    }

    /// 对端地址；传输无法提供时为 `None`。
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    pub fn response_binary_attachment(&self) -> Option<&Bytes> {
        self.response_binary_attachment.as_ref()
    }

    /// 写入响应二进制附件，覆盖之前的值。
    pub fn set_response_binary_attachment(&mut self, attachment: impl Into<Bytes>) {
        self.response_binary_attachment = Some(attachment.into());
    }

    pub fn response_kv_attachment(&self) -> Option<&KvAttachment> {
        self.response_kv_attachment.as_ref()
    }

    /// 获取响应键值附件的可写引用，首次访问时创建空映射。
    pub fn response_kv_attachment_mut(&mut self) -> &mut KvAttachment {
        self.response_kv_attachment
            .get_or_insert_with(KvAttachment::new)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{interceptor::FnInvocable, message::MethodInfo};

    fn method(includes_controller: bool) -> Arc<MethodInfo> {
        Arc::new(
            MethodInfo::new("EchoService", "echo", FnInvocable::new(|_| Ok(None)))
                .with_controller(includes_controller),
        )
    }

    #[test]
    fn not_required_for_plain_requests() {
        let request = Request::new(1, method(false));
        assert!(!Controller::is_required(&request));
    }

    #[test]
    fn required_by_method_signature() {
        let request = Request::new(1, method(true));
        assert!(Controller::is_required(&request));
    }

    #[test]
    fn required_by_empty_binary_attachment() {
        // 空附件仍是“存在”，与缺席不同。
        let request = Request::new(1, method(false)).with_binary_attachment(Bytes::new());
        assert!(Controller::is_required(&request));
    }

    #[test]
    fn required_by_kv_attachment() {
        let request = Request::new(1, method(false)).with_kv_attachment(KvAttachment::new());
        assert!(Controller::is_required(&request));
    }

    #[test]
    fn copies_request_attachments() {
        let kv: KvAttachment = [("tenant", "blue")].into_iter().collect();
        let request = Request::new(7, method(false))
            .with_binary_attachment(Bytes::from_static(b"12345"))
            .with_kv_attachment(kv.clone());
        let addr: SocketAddr = "10.0.0.1:8002".parse().expect("valid address");
        let controller = Controller::for_request(&request, Some(addr));
        assert_eq!(
            controller.request_binary_attachment().map(Bytes::as_ref),
            Some(&b"12345"[..])
        );
        assert_eq!(controller.request_kv_attachment(), Some(&kv));
        assert_eq!(controller.remote_address(), Some(addr));
        assert!(controller.response_binary_attachment().is_none());
    }

    #[test]
    fn response_kv_slot_is_created_on_demand() {
        let mut controller = Controller::default();
        assert!(controller.response_kv_attachment().is_none());
        controller.response_kv_attachment_mut().insert("k", "v");
        assert_eq!(
            controller.response_kv_attachment().and_then(|kv| kv.get("k")),
            Some("v")
        );
    }
}
