//! 服务端运行配置。
//!
//! # 教案式概览
//! - **意图（Why）**：工作线程规模、线程命名与日志过滤是宿主进程启动时一次性决定的参数，
//!   以声明式 TOML 表达，便于在部署清单中审阅；
//! - **逻辑（How）**：[`ServerOptions`] 由 `serde` 反序列化，所有字段都有默认值，未知字段直接拒绝；
//!   解析后调用 [`ServerOptions::validate`] 检查取值范围；
//! - **契约（What）**：配置在启动后不可变，执行管线只读取它，不持有可变引用。

use std::num::NonZeroUsize;

use serde::Deserialize;
use thiserror::Error as ThisError;

/// 配置解析或校验失败。
#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("failed to parse server options: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("`{field}` {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

const DEFAULT_MAX_BLOCKING_THREADS: usize = 512;
const DEFAULT_THREAD_NAME: &str = "rpc-worker";
const DEFAULT_LOG_FILTER: &str = "info";

/// 服务端选项。
///
/// | 字段 | 默认值 | 含义 |
/// |---|---|---|
/// | `worker_threads` | 可用 CPU 数 | 异步运行时的工作线程数 |
/// | `max_blocking_threads` | 512 | 执行业务逻辑的阻塞线程池上限 |
/// | `thread_name` | `rpc-worker` | 线程名前缀，出现在“execution task started”日志中 |
/// | `log_filter` | `info` | `RUST_LOG` 缺省时使用的过滤指令 |
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerOptions {
    worker_threads: usize,
    max_blocking_threads: usize,
    thread_name: String,
    log_filter: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            max_blocking_threads: DEFAULT_MAX_BLOCKING_THREADS,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            log_filter: DEFAULT_LOG_FILTER.to_owned(),
        }
    }
}

impl ServerOptions {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(raw)?;
        options.validate()?;
        Ok(options)
    }

    /// 检查取值范围。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_threads",
                reason: "must be at least 1",
            });
        }
        if self.max_blocking_threads == 0 {
            return Err(ConfigError::Invalid {
                field: "max_blocking_threads",
                reason: "must be at least 1",
            });
        }
        if self.thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "thread_name",
                reason: "must not be blank",
            });
        }
        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "log_filter",
                reason: "must not be blank",
            });
        }
        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn max_blocking_threads(&self) -> usize {
        self.max_blocking_threads
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_max_blocking_threads(mut self, max_blocking_threads: usize) -> Self {
        self.max_blocking_threads = max_blocking_threads;
        self
    }

    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    pub fn with_log_filter(mut self, log_filter: impl Into<String>) -> Self {
        self.log_filter = log_filter.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let options = ServerOptions::from_toml_str("").expect("defaults are valid");
        assert_eq!(options, ServerOptions::default());
        assert_eq!(options.thread_name(), "rpc-worker");
        assert!(options.worker_threads() >= 1);
    }

    #[test]
    fn partial_document_overrides_fields() {
        let options = ServerOptions::from_toml_str(
            r#"
            worker_threads = 4
            thread_name = "echo-worker"
            log_filter = "spark_rpc=debug"
            "#,
        )
        .expect("valid options");
        assert_eq!(options.worker_threads(), 4);
        assert_eq!(options.max_blocking_threads(), 512);
        assert_eq!(options.thread_name(), "echo-worker");
        assert_eq!(options.log_filter(), "spark_rpc=debug");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = ServerOptions::from_toml_str("workers = 4").expect_err("unknown key");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_workers_fail_validation() {
        let err = ServerOptions::from_toml_str("worker_threads = 0").expect_err("out of range");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "worker_threads",
                ..
            }
        ));
    }
}
