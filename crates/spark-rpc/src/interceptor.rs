//! 拦截器链：包裹业务方法调用的有序中间件管线。
//!
//! # 教案式概览
//! - **意图（Why）**：鉴权、限流、日志等横切行为需要在业务方法前后插入，且彼此可自由组合；
//!   执行任务只关心“整条链成功或失败”，不关心链上有哪些环节。
//! - **逻辑（How）**：
//!   - 服务端启动时把拦截器列表冻结为 `Arc<[Arc<dyn Interceptor>]>`，每个任务只持有只读引用；
//!   - [`Next`] 是指向“剩余环节”的游标，拦截器调用 [`Next::proceed`] 才会进入下一环；
//!     不调用即为短路；
//!   - 链尾是终端环节：取出请求参数，按需注入 [`Controller`]，调用绑定在 [`MethodInfo`] 上的
//!     [`Invocable`]，并把返回值写入响应。
//! - **契约（What）**：
//!   - 拦截器可以读写 `Request`/`Response`，可以短路，但必须把内层失败原样向外传播；
//!   - 业务方法失败以 [`InterceptError::Invocation`] 出现，拦截器自身失败以
//!     [`InterceptError::Chain`] 出现，二者由任务边界分类回收。
//!
//! [`MethodInfo`]: crate::message::MethodInfo

use std::{any::Any, borrow::Cow, fmt, sync::Arc};

use crate::{
    controller::Controller,
    error::{InterceptError, InvocationFailure, RpcError, codes},
    message::{Body, Request, Response},
};

/// 业务方法的动态调用能力。
///
/// # 契约说明（What）
/// - 每个已解析的方法恰好绑定一个 `Invocable`，由链的终端环节调用；
/// - 失败以 [`InvocationFailure`] 报告，其 `target` 为业务方法真正抛出的原因；
/// - 实现可能阻塞当前工作线程，该成本归属业务逻辑。
pub trait Invocable: Send + Sync + 'static {
    fn invoke(&self, invocation: Invocation<'_>) -> Result<Option<Body>, InvocationFailure>;
}

/// 一次业务方法调用的输入。
///
/// `controller` 仅在方法声明需要控制器时存在。
pub struct Invocation<'a> {
    args: Option<Body>,
    controller: Option<&'a mut Controller>,
}

impl<'a> Invocation<'a> {
    pub fn new(args: Option<Body>, controller: Option<&'a mut Controller>) -> Self {
        Self { args, controller }
    }

    pub fn args(&self) -> Option<&Body> {
        self.args.as_ref()
    }

    /// 按具体类型借用参数。
    pub fn args_as<T: Any>(&self) -> Option<&T> {
        self.args.as_ref().and_then(|body| body.downcast_ref())
    }

    /// 取走参数的所有权。
    pub fn take_args(&mut self) -> Option<Body> {
        self.args.take()
    }

    pub fn controller(&mut self) -> Option<&mut Controller> {
        self.controller.as_deref_mut()
    }
}

impl fmt::Debug for Invocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("has_args", &self.args.is_some())
            .field("controller", &self.controller)
            .finish()
    }
}

/// 以闭包实现的 [`Invocable`]。
pub struct FnInvocable<F> {
    handler: F,
}

impl<F> FnInvocable<F> {
    pub fn new(handler: F) -> Self
    where
        F: Fn(Invocation<'_>) -> Result<Option<Body>, InvocationFailure> + Send + Sync + 'static,
    {
        Self { handler }
    }
}

impl<F> Invocable for FnInvocable<F>
where
    F: Fn(Invocation<'_>) -> Result<Option<Body>, InvocationFailure> + Send + Sync + 'static,
{
    fn invoke(&self, invocation: Invocation<'_>) -> Result<Option<Body>, InvocationFailure> {
        (self.handler)(invocation)
    }
}

/// 拦截器元数据，用于日志与诊断。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterceptorDescriptor {
    name: Cow<'static, str>,
    category: Cow<'static, str>,
    summary: Cow<'static, str>,
}

impl InterceptorDescriptor {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        category: impl Into<Cow<'static, str>>,
        summary: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            summary: summary.into(),
        }
    }

    /// 匿名描述，适合测试或临时拦截器。
    pub fn anonymous(stage: impl Into<Cow<'static, str>>) -> Self {
        let stage = stage.into();
        Self {
            name: Cow::Owned(format!("anonymous.{stage}")),
            category: Cow::Borrowed("unspecified"),
            summary: Cow::Owned(format!("auto-generated descriptor for {stage}")),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }
}

/// 拦截器契约。
///
/// # 教案级说明
///
/// ## 意图 (Why)
/// - 以统一签名承载横切逻辑，服务端在启动时一次性装配，运行期只读共享。
///
/// ## 契约 (What)
/// - `intercept` 可检查、修改请求与响应；调用 `next.proceed(..)` 进入内层；
/// - 不调用 `next` 即短路，此时业务方法不会执行；
/// - 内层返回的错误必须原样返回，拦截器可以附加日志，但不得改写错误内容；
/// - 实现会被多个工作线程并发调用，内部状态需自行同步。
pub trait Interceptor: Send + Sync + 'static {
    fn descriptor(&self) -> InterceptorDescriptor {
        InterceptorDescriptor::anonymous(std::any::type_name::<Self>())
    }

    fn intercept(
        &self,
        request: &mut Request,
        response: &mut Response,
        next: Next<'_>,
    ) -> Result<(), InterceptError>;
}

/// 指向链中剩余环节的游标。
#[derive(Clone, Copy)]
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Interceptor>],
}

impl<'a> Next<'a> {
    /// 执行剩余环节；没有剩余拦截器时进入终端环节调用业务方法。
    pub fn proceed(self, request: &mut Request, response: &mut Response) -> Result<(), InterceptError> {
        match self.remaining.split_first() {
            Some((head, tail)) => head.intercept(request, response, Next { remaining: tail }),
            None => invoke_target(request, response),
        }
    }

    /// 剩余拦截器数量（不含终端环节）。
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.remaining.len())
            .finish()
    }
}

/// 终端环节。
fn invoke_target(request: &mut Request, response: &mut Response) -> Result<(), InterceptError> {
    let method = request.method_info().cloned().ok_or_else(|| {
        RpcError::new(
            codes::METHOD_UNRESOLVED,
            "request reached the interceptor chain without a resolved method",
        )
    })?;
    let args = request.take_args();
    let controller = if method.includes_controller() {
        request.controller_mut()
    } else {
        None
    };
    let result = method
        .invocable()
        .invoke(Invocation::new(args, controller))?;
    response.set_result(result);
    Ok(())
}

/// 冻结后的拦截器链，可在任务之间廉价克隆。
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl InterceptorChain {
    pub fn new(interceptors: impl Into<Arc<[Arc<dyn Interceptor>]>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    /// 不含任何拦截器的链，直接调用业务方法。
    pub fn empty() -> Self {
        Self::default()
    }

    /// 从首个拦截器开始执行整条链。
    pub fn intercept(&self, request: &mut Request, response: &mut Response) -> Result<(), InterceptError> {
        Next {
            remaining: &self.interceptors,
        }
        .proceed(request, response)
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = InterceptorDescriptor> + '_ {
        self.interceptors.iter().map(|interceptor| interceptor.descriptor())
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.interceptors.iter().map(|interceptor| interceptor.descriptor()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::message::MethodInfo;

    struct Tagging {
        tag: &'static str,
        trail: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Interceptor for Tagging {
        fn intercept(
            &self,
            request: &mut Request,
            response: &mut Response,
            next: Next<'_>,
        ) -> Result<(), InterceptError> {
            self.trail.lock().push(self.tag);
            next.proceed(request, response)
        }
    }

    struct Reject;

    impl Interceptor for Reject {
        fn descriptor(&self) -> InterceptorDescriptor {
            InterceptorDescriptor::new("reject", "auth", "denies every call")
        }

        fn intercept(
            &self,
            _request: &mut Request,
            _response: &mut Response,
            _next: Next<'_>,
        ) -> Result<(), InterceptError> {
            Err(RpcError::rejected("missing token").into())
        }
    }

    fn upper_method(calls: Arc<AtomicUsize>) -> Arc<MethodInfo> {
        Arc::new(MethodInfo::new(
            "TextService",
            "upper",
            FnInvocable::new(move |invocation| {
                calls.fetch_add(1, Ordering::SeqCst);
                let text = invocation
                    .args_as::<String>()
                    .ok_or_else(|| InvocationFailure::new(RpcError::service("expected text")))?;
                Ok(Some(Box::new(text.to_uppercase()) as Body))
            }),
        ))
    }

    #[test]
    fn runs_in_order_and_reaches_target() {
        let trail = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Tagging { tag: "outer", trail: Arc::clone(&trail) }),
            Arc::new(Tagging { tag: "inner", trail: Arc::clone(&trail) }),
        ];
        let chain = InterceptorChain::new(interceptors);
        let mut request = Request::new(1, upper_method(Arc::clone(&calls))).with_args(String::from("hi"));
        let mut response = Response::new();

        chain.intercept(&mut request, &mut response).expect("chain succeeds");

        assert_eq!(*trail.lock(), ["outer", "inner"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(response.result_as::<String>().map(String::as_str), Some("HI"));
        assert!(request.args().is_none(), "terminal link takes the args");
    }

    #[test]
    fn short_circuit_skips_target() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = InterceptorChain::new(vec![Arc::new(Reject) as Arc<dyn Interceptor>]);
        let mut request = Request::new(1, upper_method(Arc::clone(&calls))).with_args(String::from("hi"));
        let mut response = Response::new();

        let err = chain
            .intercept(&mut request, &mut response)
            .expect_err("rejected");

        assert!(matches!(err, InterceptError::Chain(ref e) if e.code() == codes::INTERCEPTOR_REJECTED));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(chain.descriptors().next().map(|d| d.category().to_owned()).as_deref(), Some("auth"));
    }

    #[test]
    fn business_failure_surfaces_as_invocation_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut request = Request::new(1, upper_method(calls)).with_args(42_u32);
        let mut response = Response::new();

        let err = InterceptorChain::empty()
            .intercept(&mut request, &mut response)
            .expect_err("wrong argument type");

        assert!(matches!(err, InterceptError::Invocation(_)));
        assert_eq!(err.into_response_error().message(), "expected text");
    }

    #[test]
    fn unresolved_method_is_a_chain_failure() {
        let mut request = Request::unresolved(5);
        let mut response = Response::new();
        let err = InterceptorChain::empty()
            .intercept(&mut request, &mut response)
            .expect_err("no method bound");
        assert!(matches!(err, InterceptError::Chain(ref e) if e.code() == codes::METHOD_UNRESOLVED));
    }

    #[test]
    fn controller_is_injected_only_when_declared() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let make = |includes: bool| {
            let seen = Arc::clone(&seen);
            Arc::new(
                MethodInfo::new(
                    "AttachmentService",
                    "probe",
                    FnInvocable::new(move |mut invocation| {
                        seen.lock().push(invocation.controller().is_some());
                        Ok(None)
                    }),
                )
                .with_controller(includes),
            )
        };

        for includes in [true, false] {
            let mut request = Request::new(1, make(includes)).with_binary_attachment(Bytes::from_static(b"x"));
            let controller = Controller::for_request(&request, None);
            request.attach_controller(controller);
            InterceptorChain::empty()
                .intercept(&mut request, &mut Response::new())
                .expect("probe succeeds");
        }

        assert_eq!(*seen.lock(), [true, false]);
    }
}
