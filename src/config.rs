//! 配置
//!
//! StreamSync 只关心端点 URL、重连间隔与最大重连次数；FetchCache 只关心 TTL。

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// 默认事件流端点
pub const DEFAULT_STREAM_URL: &str = "ws://localhost:8000/ws/agents";
/// 默认重连间隔（毫秒）
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;
/// 默认最大重连次数
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// 默认缓存 TTL（毫秒）
pub const DEFAULT_CACHE_TTL_MS: u64 = 30_000;

/// 事件流订阅配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 事件流端点（ws:// 或 wss://）
    pub url: String,
    /// 断线后等待多久再重连
    pub reconnect_delay: Duration,
    /// 连续重连失败上限，达到后进入 Failed
    pub max_reconnect_attempts: u32,
    /// 出站消息缓冲区大小
    pub outbound_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_STREAM_URL.to_string(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            outbound_buffer: 100,
        }
    }
}

impl SyncConfig {
    /// 创建指定端点的配置，其余使用默认值
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// 从环境变量创建配置
    ///
    /// - `AGENT_STREAM_URL`
    /// - `AGENT_STREAM_RECONNECT_DELAY_MS`
    /// - `AGENT_STREAM_MAX_RECONNECT_ATTEMPTS`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("AGENT_STREAM_URL") {
            config.url = url;
        }
        if let Some(ms) = env_parse::<u64>("AGENT_STREAM_RECONNECT_DELAY_MS") {
            config.reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(max) = env_parse::<u32>("AGENT_STREAM_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = max;
        }

        config
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "事件流端点必须是 ws:// 或 wss://: {}",
                self.url
            )));
        }
        if self.outbound_buffer == 0 {
            return Err(Error::Config("outbound_buffer 不能为 0".to_string()));
        }
        Ok(())
    }

    /// 设置重连间隔
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// 设置最大重连次数
    pub fn with_max_reconnect_attempts(mut self, max: u32) -> Self {
        self.max_reconnect_attempts = max;
        self
    }
}

/// 读缓存配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// 条目有效期，所有 key 共用
    pub ttl: Duration,
    /// 单次获取超时（None = 不限制）
    pub fetch_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            fetch_timeout: None,
        }
    }
}

impl CacheConfig {
    /// 从环境变量创建配置
    ///
    /// - `FETCH_CACHE_TTL_MS`
    /// - `FETCH_CACHE_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_parse::<u64>("FETCH_CACHE_TTL_MS") {
            config.ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("FETCH_CACHE_TIMEOUT_MS") {
            config.fetch_timeout = Some(Duration::from_millis(ms));
        }

        config
    }

    /// 设置 TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// 设置获取超时
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }
}

/// 读取并解析环境变量，解析失败时告警并返回 None
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("⚠️ 环境变量 {}={:?} 无法解析，使用默认值", name, raw);
            None
        }
    }
}
