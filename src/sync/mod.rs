//! StreamSync 模块 - 自愈事件流 + Agent 集合归约
//!
//! - 维护到事件流端点的连接，断线后按固定间隔重连，超过上限进入 Failed
//! - 按到达顺序把 initial / spawn / update / remove 事件折叠成本地集合
//! - 断线期间保留最后一次已知的集合，直到新的 initial 替换它

pub mod reducer;
pub mod state;
pub mod stream;
pub mod transport;

pub use reducer::{AgentCollection, Change};
pub use state::{Action, ConnectionHealth, ConnectionMachine, ConnectionState, Input};
pub use stream::{StreamSync, SyncSnapshot};
pub use transport::{Connection, Connector, Inbound};

#[cfg(feature = "websocket")]
pub use transport::WebSocketConnector;
