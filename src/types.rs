//! 数据类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Agent 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Idle,
    Error,
    Completed,
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(AgentStatus::Active),
            "idle" => Ok(AgentStatus::Idle),
            "error" => Ok(AgentStatus::Error),
            "completed" => Ok(AgentStatus::Completed),
            _ => Err(format!("Invalid agent status: {}", s)),
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Completed => write!(f, "completed"),
        }
    }
}

/// 资源占用快照（每次刷新整体替换，不是累计值）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

/// Agent 记录
///
/// 一个远端 worker 进程的本地快照。`parent_id` 只是查找用的引用，
/// 父记录可能已经不存在。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub task: String,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    /// 仅在 status == error 时出现
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentRecord {
    /// 创建一条 active 状态的记录
    pub fn new(id: impl Into<String>, name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            task: task.into(),
            status: AgentStatus::Active,
            parent_id: None,
            start_time: Utc::now(),
            end_time: None,
            resource_usage: None,
            error: None,
        }
    }

    /// 设置状态
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    /// 设置父 Agent
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// 是否已结束
    pub fn is_finished(&self) -> bool {
        matches!(self.status, AgentStatus::Completed | AgentStatus::Error) || self.end_time.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_status_roundtrip_str() {
        assert_eq!("Active".parse::<AgentStatus>().unwrap(), AgentStatus::Active);
        assert_eq!(AgentStatus::Completed.to_string(), "completed");
        assert!("running".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn test_agent_record_deserialize_camel_case() {
        let json = r#"{
            "id": "agent-1",
            "name": "researcher",
            "task": "collect sources",
            "status": "error",
            "parentId": "root",
            "startTime": "2024-05-01T10:00:00Z",
            "endTime": "2024-05-01T10:05:00Z",
            "resourceUsage": {"tokens": 1200, "cpu": 0.5},
            "error": "rate limited"
        }"#;

        let record: AgentRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "agent-1");
        assert_eq!(record.status, AgentStatus::Error);
        assert_eq!(record.parent_id.as_deref(), Some("root"));
        assert!(record.end_time.is_some());
        let usage = record.resource_usage.unwrap();
        assert_eq!(usage.tokens, Some(1200));
        assert_eq!(usage.memory, None);
        assert_eq!(record.error.as_deref(), Some("rate limited"));
    }

    #[test]
    fn test_agent_record_serialize_skips_absent_fields() {
        let record = AgentRecord::new("a", "n", "t");
        let json = serde_json::to_string(&record).unwrap();

        assert!(json.contains("\"startTime\""));
        assert!(!json.contains("parentId"));
        assert!(!json.contains("endTime"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_is_finished() {
        let record = AgentRecord::new("a", "n", "t");
        assert!(!record.is_finished());
        assert!(record.with_status(AgentStatus::Completed).is_finished());
    }
}
