//! 执行任务的性质测试。
//!
//! # 教案级注释概览
//! - **核心目标 (Why)**：对任意请求形态（关联 ID、压缩类型、是否声明控制器、附件有无、预置异常、
//!   业务方法成功或失败、编码成功或失败）验证：
//!   1. 响应的 `log_id`/`compress_type`/`method_info` 总是镜像自请求；
//!   2. 控制器当且仅当“方法声明需要或任一附件存在”时创建；
//!   3. 编码成功时恰好一次写出与一次通知，编码失败时两者皆为零；
//!   4. 业务失败只体现在 `Response.exception`，任务本身总能返回报告。
//! - **设计手法 (How)**：以 `RequestShape` 描述随机请求，通过 `proptest` 组合生成器展开。

use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;
use spark_rpc::{
    CompressType, ExecutionTask, FnInvocable, InterceptorChain, InvocationFailure, KvAttachment,
    MethodInfo, Request, Response, RpcError, ServerContext, TaskState, codes,
    test_stubs::{NoopLogger, RecordingChannel, RecordingProtocol},
};

#[derive(Clone, Debug)]
struct RequestShape {
    log_id: u64,
    compress: CompressType,
    includes_controller: bool,
    binary: Option<Vec<u8>>,
    kv: Option<Vec<(String, String)>>,
    pre_failed: bool,
    business_fails: bool,
    encode_fails: bool,
}

fn compress_type() -> impl Strategy<Value = CompressType> {
    prop::sample::select(CompressType::ALL.to_vec())
}

fn request_shape() -> impl Strategy<Value = RequestShape> {
    (
        any::<u64>(),
        compress_type(),
        any::<bool>(),
        prop::option::of(prop::collection::vec(any::<u8>(), 0..16)),
        prop::option::of(prop::collection::vec(("[a-z]{1,6}", "[a-z0-9]{0,6}"), 0..4)),
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            |(log_id, compress, includes_controller, binary, kv, pre_failed, business_fails, encode_fails)| {
                RequestShape {
                    log_id,
                    compress,
                    includes_controller,
                    binary,
                    kv,
                    pre_failed,
                    business_fails,
                    encode_fails,
                }
            },
        )
}

fn build_request(shape: &RequestShape) -> (Request, Arc<MethodInfo>) {
    let fails = shape.business_fails;
    let method = Arc::new(
        MethodInfo::new(
            "PropertyService",
            "call",
            FnInvocable::new(move |_| {
                if fails {
                    Err(InvocationFailure::new(RpcError::service("generated failure")))
                } else {
                    Ok(None)
                }
            }),
        )
        .with_controller(shape.includes_controller),
    );
    let mut request = Request::new(shape.log_id, Arc::clone(&method)).with_compress_type(shape.compress);
    if let Some(binary) = &shape.binary {
        request = request.with_binary_attachment(Bytes::from(binary.clone()));
    }
    if let Some(kv) = &shape.kv {
        request = request.with_kv_attachment(kv.iter().cloned().collect::<KvAttachment>());
    }
    if shape.pre_failed {
        request = request.with_exception(RpcError::new(codes::DECODE_FAILED, "generated"));
    }
    (request, method)
}

proptest! {
    #[test]
    fn prop_response_mirrors_request(shape in request_shape()) {
        let (request, method) = build_request(&shape);
        let protocol = if shape.encode_fails {
            RecordingProtocol::failing_encode()
        } else {
            RecordingProtocol::new()
        };
        let task = ExecutionTask::new(
            ServerContext::new(InterceptorChain::empty(), Arc::new(NoopLogger)),
            Arc::new(protocol),
            Arc::new(RecordingChannel::new("prop")),
            Some(request),
            Response::new(),
        );

        let report = task.execute();
        let response = report.response();

        prop_assert_eq!(response.log_id(), shape.log_id);
        prop_assert_eq!(response.compress_type(), shape.compress);
        prop_assert!(response.method_info().is_some_and(|mirrored| Arc::ptr_eq(mirrored, &method)));
    }

    #[test]
    fn prop_controller_created_iff_needed(shape in request_shape()) {
        let (request, _) = build_request(&shape);
        let expected = shape.includes_controller || shape.binary.is_some() || shape.kv.is_some();
        let task = ExecutionTask::new(
            ServerContext::new(InterceptorChain::empty(), Arc::new(NoopLogger)),
            Arc::new(RecordingProtocol::new()),
            Arc::new(RecordingChannel::new("prop")),
            Some(request),
            Response::new(),
        );

        let report = task.execute();

        let created = report.request().and_then(Request::controller).is_some();
        prop_assert_eq!(created, expected);
    }

    #[test]
    fn prop_send_happens_exactly_once_per_encode(shape in request_shape()) {
        let (request, _) = build_request(&shape);
        let protocol = Arc::new(if shape.encode_fails {
            RecordingProtocol::failing_encode()
        } else {
            RecordingProtocol::new()
        });
        let channel = Arc::new(RecordingChannel::new("prop"));
        let task = ExecutionTask::new(
            ServerContext::new(InterceptorChain::empty(), Arc::new(NoopLogger)),
            protocol.clone(),
            channel.clone(),
            Some(request),
            Response::new(),
        );

        let report = task.execute();

        let expected = usize::from(!shape.encode_fails);
        prop_assert_eq!(protocol.encodes(), 1);
        prop_assert_eq!(channel.write_count(), expected);
        prop_assert_eq!(protocol.notifications(), expected);
        let terminal = if shape.encode_fails { TaskState::EncodeFailed } else { TaskState::Notified };
        prop_assert_eq!(report.state(), terminal);

        let exception_code = report.response().exception().map(|err| err.code());
        let expected_code = if shape.pre_failed {
            Some(codes::DECODE_FAILED)
        } else if shape.business_fails {
            Some(codes::SERVICE_FAILED)
        } else {
            None
        };
        prop_assert_eq!(exception_code, expected_code);
    }
}
