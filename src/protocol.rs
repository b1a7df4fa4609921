//! 事件流协议定义
//!
//! 通信方式：WebSocket 文本帧，每帧一条 JSON 消息。
//!
//! 入站信封：`{ type, agent?, agents?, agentId? }`
//! - `initial` 携带 `agents`（完整列表）
//! - `spawn` / `update` 携带 `agent`
//! - `remove` 携带 `agentId`

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AgentRecord;

/// 已知的事件类型
pub mod event_kind {
    pub const INITIAL: &str = "initial";
    pub const SPAWN: &str = "spawn";
    pub const UPDATE: &str = "update";
    pub const REMOVE: &str = "remove";

    pub const ALL: [&str; 4] = [INITIAL, SPAWN, UPDATE, REMOVE];
}

/// 推送事件（Server → Client）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    /// 全量快照，无条件替换本地集合（每次连接后第一条）
    Initial { agents: Vec<AgentRecord> },

    /// 新 Agent
    Spawn { agent: AgentRecord },

    /// Agent 更新（整条替换）
    Update { agent: AgentRecord },

    /// Agent 移除
    Remove {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
}

impl StreamEvent {
    /// 事件类型名（与信封中的 `type` 一致）
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Initial { .. } => event_kind::INITIAL,
            StreamEvent::Spawn { .. } => event_kind::SPAWN,
            StreamEvent::Update { .. } => event_kind::UPDATE,
            StreamEvent::Remove { .. } => event_kind::REMOVE,
        }
    }
}

/// 入站消息解码错误
#[derive(Error, Debug)]
pub enum DecodeError {
    /// 不是合法 JSON，或字段与事件类型不匹配
    #[error("消息格式错误: {0}")]
    Malformed(#[from] serde_json::Error),

    /// 缺少 type 字段
    #[error("消息缺少 type 字段")]
    MissingType,

    /// 未知事件类型（向前兼容，静默忽略）
    #[error("未知事件类型: {0}")]
    UnknownKind(String),
}

/// 解码一条入站文本消息
pub fn decode_event(text: &str) -> Result<StreamEvent, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(DecodeError::MissingType)?;

    if !event_kind::ALL.contains(&kind) {
        return Err(DecodeError::UnknownKind(kind.to_string()));
    }

    Ok(serde_json::from_value(value)?)
}
