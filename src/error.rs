//! 错误类型定义

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 数据获取失败（所有合并到同一请求的调用方看到同一个错误）
    #[error("获取 {key} 失败: {cause:#}")]
    Fetch {
        key: String,
        cause: Arc<anyhow::Error>,
    },

    /// 数据获取超时
    #[error("获取 {key} 超时 ({after:?})")]
    Timeout { key: String, after: Duration },

    /// HTTP 错误
    #[cfg(feature = "rest")]
    #[error("HTTP 错误: {0}")]
    Http(#[from] reqwest::Error),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
