//! 任意 `AsyncWrite` 之上的连接实现。
//!
//! - **意图（Why）**：执行任务在阻塞线程上发起写出，真正的 IO 由运行时上的写任务完成；
//! - **契约（What）**：同一通道上的写出按提交顺序落盘，每个写完成句柄恰好完成一次。

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use spark_rpc::{
    Channel, KeyValue, Logger, TransportError, WriteCompletion, WritePromise, WriteResult,
    observability::keys, write_completion,
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    runtime::Handle,
    sync::mpsc,
};

enum Command {
    Write(Bytes, WritePromise),
    Close,
}

/// 以写任务串行化写出的流式通道。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 执行任务在阻塞线程上发起写出，不能在那里等待套接字可写；写出交给运行时上的写任务，
///   执行任务立即拿到 [`WriteCompletion`]；
/// - 同一连接上多个任务并发写出时，由单个写任务保证帧不交错。
///
/// ## 逻辑 (How)
/// - `write_async` 把字节与 promise 投入无界队列；写任务按 FIFO 顺序执行 `write_all + flush`，
///   并在写任务所在线程上完成 promise；
/// - `close` 向队列追加关闭指令：之前排队的写出先完成，随后 `shutdown` 写半部；
/// - 写出失败后通道转为非活跃，队列中剩余写出以 [`TransportError::Closed`] 完成。
///
/// ## 契约 (What)
/// - 关闭后的写出立即以 `Closed` 完成，不入队；
/// - 每个 promise 恰好完成一次。
pub struct StreamChannel {
    id: String,
    remote: Option<SocketAddr>,
    commands: mpsc::UnboundedSender<Command>,
    active: Arc<AtomicBool>,
}

impl StreamChannel {
    /// 在 `handle` 上启动写任务并返回通道。
    pub fn spawn<W>(
        id: impl Into<String>,
        remote: Option<SocketAddr>,
        writer: W,
        handle: &Handle,
        logger: Arc<dyn Logger>,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = id.into();
        let (commands, queue) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        handle.spawn(run_writer(
            id.clone(),
            writer,
            queue,
            Arc::clone(&active),
            logger,
        ));
        Arc::new(Self {
            id,
            remote,
            commands,
            active,
        })
    }
}

impl Channel for StreamChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn write_async(&self, bytes: Bytes) -> WriteCompletion {
        if !self.is_active() {
            return WriteCompletion::ready(Err(TransportError::Closed));
        }
        let (promise, completion) = write_completion();
        if let Err(mpsc::error::SendError(command)) =
            self.commands.send(Command::Write(bytes, promise))
        {
            reject(command);
        }
        completion
    }

    fn close(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            // 写任务已退出时无需再通知。
            let _ = self.commands.send(Command::Close);
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && !self.commands.is_closed()
    }
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("active", &self.is_active())
            .finish()
    }
}

fn reject(command: Command) {
    if let Command::Write(_, promise) = command {
        promise.fail(TransportError::Closed);
    }
}

async fn run_writer<W>(
    id: String,
    mut writer: W,
    mut queue: mpsc::UnboundedReceiver<Command>,
    active: Arc<AtomicBool>,
    logger: Arc<dyn Logger>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(command) = queue.recv().await {
        match command {
            Command::Write(bytes, promise) => {
                let result = write_frame(&mut writer, &bytes).await;
                let failed = result.is_err();
                if let Err(err) = &result {
                    logger.warn_with_fields(
                        &format!("channel write failed, msg={err}"),
                        &[
                            KeyValue::new(keys::CHANNEL_ID, id.as_str()),
                            KeyValue::new("net.write.bytes", bytes.len()),
                        ],
                    );
                }
                let panicked = promise.complete(result);
                if panicked > 0 {
                    logger.warn_with_fields(
                        "write completion listener panicked",
                        &[
                            KeyValue::new(keys::CHANNEL_ID, id.as_str()),
                            KeyValue::new("listener.panicked", panicked),
                        ],
                    );
                }
                if failed {
                    active.store(false, Ordering::SeqCst);
                    break;
                }
            }
            Command::Close => {
                if let Err(err) = writer.shutdown().await {
                    logger.warn_with_fields(
                        &format!("channel shutdown failed, msg={err}"),
                        &[KeyValue::new(keys::CHANNEL_ID, id.as_str())],
                    );
                }
                break;
            }
        }
    }

    active.store(false, Ordering::SeqCst);
    queue.close();
    while let Ok(command) = queue.try_recv() {
        reject(command);
    }
    logger.debug_with_fields(
        "channel writer stopped",
        &[KeyValue::new(keys::CHANNEL_ID, id.as_str())],
    );
}

async fn write_frame<W>(writer: &mut W, bytes: &[u8]) -> WriteResult
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}
