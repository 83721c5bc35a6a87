#![deny(unsafe_code)]
#![doc = "spark-rpc-tokio: spark-rpc 执行管线在 Tokio 上的协作者实现。"]
#![doc = ""]
#![doc = "- [`TokioWorkerPool`]：把执行任务投递到阻塞线程池；"]
#![doc = "- [`StreamChannel`]：任意 `AsyncWrite` 之上的连接，写出在独立写任务上完成。"]

mod channel;
mod pool;

pub use channel::StreamChannel;
pub use pool::{PoolError, TokioWorkerPool};
