//! agent-fleet-sync - Agent 集群客户端状态同步层
//!
//! 为管理面板提供两块核心能力，二者互不依赖，只在展示层组合：
//!
//! # 核心功能
//!
//! - **StreamSync**: 自愈的事件流订阅，把 initial / spawn / update / remove 事件
//!   按到达顺序折叠成本地 Agent 集合；断线自动重连，超过上限进入 Failed
//! - **FetchCache**: 带 TTL 的读穿透缓存，同一 key 的并发请求合并为一次获取，
//!   写操作后由调用方显式失效
//!
//! # Feature Flags
//!
//! - `websocket`: WebSocket 连接器（tokio-tungstenite）
//! - `rest`: REST JSON 数据源（reqwest + FetchCache）
//!
//! # 并发模型
//!
//! 每个 StreamSync 实例由单个驱动任务串行处理连接事件与入站消息，外部只读快照；
//! FetchCache 的缓存表与在途表由同一把锁保护，producer 在独立任务中运行到结束。

pub mod cache;
pub mod config;
pub mod error;
pub mod protocol;
pub mod sync;
pub mod types;

// Re-exports
pub use cache::{cache_key, CacheStats, FetchCache};
pub use config::{CacheConfig, SyncConfig};
pub use error::{Error, Result};
pub use protocol::{decode_event, DecodeError, StreamEvent};
pub use sync::{
    AgentCollection, ConnectionHealth, ConnectionState, Connector, StreamSync, SyncSnapshot,
};
pub use types::*;

#[cfg(feature = "websocket")]
pub use sync::WebSocketConnector;

#[cfg(feature = "rest")]
pub use cache::RestSource;
