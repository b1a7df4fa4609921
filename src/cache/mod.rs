//! FetchCache 模块 - 读穿透缓存 + 请求合并
//!
//! 提供带 TTL 的读缓存，同一 key 的并发请求只触发一次底层获取

mod fetch;

#[cfg(feature = "rest")]
mod rest;

pub use fetch::{cache_key, CacheStats, FetchCache};

#[cfg(feature = "rest")]
pub use rest::RestSource;
