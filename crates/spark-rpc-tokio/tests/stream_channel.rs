//! `StreamChannel` 写出顺序、关闭与失败传播。

use std::sync::Arc;

use bytes::Bytes;
use spark_rpc::{
    Channel, TransportError,
    test_stubs::{NoopLogger, RecordingLogger},
};
use spark_rpc_tokio::StreamChannel;
use tokio::{io::AsyncReadExt, runtime::Handle};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_arrive_in_submission_order() {
    let (client, mut server) = tokio::io::duplex(64);
    let channel = StreamChannel::spawn("duplex-1", None, client, &Handle::current(), Arc::new(NoopLogger));

    let first = channel.write_async(Bytes::from_static(b"alpha;"));
    let second = channel.write_async(Bytes::from_static(b"beta;"));

    assert_eq!(first.await, Ok(()));
    assert_eq!(second.await, Ok(()));

    let mut buf = vec![0_u8; 11];
    server.read_exact(&mut buf).await.expect("frames readable");
    assert_eq!(&buf, b"alpha;beta;");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_flushes_then_rejects() {
    let (client, mut server) = tokio::io::duplex(64);
    let channel = StreamChannel::spawn("duplex-2", None, client, &Handle::current(), Arc::new(NoopLogger));

    let queued = channel.write_async(Bytes::from_static(b"last"));
    channel.close();
    let rejected = channel.write_async(Bytes::from_static(b"late"));

    assert!(!channel.is_active());
    assert_eq!(rejected.await, Err(TransportError::Closed));
    assert_eq!(queued.await, Ok(()));

    let mut received = Vec::new();
    server
        .read_to_end(&mut received)
        .await
        .expect("writer shut down cleanly");
    assert_eq!(received, b"last");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broken_peer_fails_write_and_deactivates() {
    let (client, server) = tokio::io::duplex(8);
    drop(server);
    let logger = Arc::new(RecordingLogger::new());
    let channel = StreamChannel::spawn("duplex-3", None, client, &Handle::current(), logger.clone());

    let result = channel.write_async(Bytes::from_static(b"nobody listening")).await;

    assert!(matches!(result, Err(TransportError::Io(_))));
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!channel.is_active());
    assert_eq!(
        channel.write_async(Bytes::from_static(b"again")).await,
        Err(TransportError::Closed)
    );
    assert!(logger.contains(spark_rpc::LogSeverity::Warn, "channel write failed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completion_listener_runs_on_writer_side() {
    let (client, mut server) = tokio::io::duplex(64);
    let channel = StreamChannel::spawn("duplex-4", None, client, &Handle::current(), Arc::new(NoopLogger));
    let (tx, rx) = tokio::sync::oneshot::channel();

    let completion = channel.write_async(Bytes::from_static(b"ok"));
    completion.on_complete(move |result| {
        let _ = tx.send(result.clone());
    });

    assert_eq!(rx.await.expect("listener fired"), Ok(()));
    let mut buf = [0_u8; 2];
    server.read_exact(&mut buf).await.expect("payload readable");
    assert_eq!(&buf, b"ok");
}
