//! 事件归约
//!
//! 把有序的事件流折叠成本地 Agent 集合。集合内每个 id 至多一条记录，
//! 保持事件到达顺序（initial 中的顺序，之后 spawn 追加到末尾）。

use std::collections::HashMap;

use serde::Serialize;

use crate::protocol::StreamEvent;
use crate::types::{AgentRecord, AgentStatus};

/// 一次归约对集合造成的变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// 全量替换
    Replaced { count: usize },
    /// 新增
    Added,
    /// 已存在的记录被整条替换
    Updated,
    Removed,
    /// 无变化（update / remove 的 id 不存在）
    Unchanged,
}

impl Change {
    pub fn is_changed(&self) -> bool {
        !matches!(self, Change::Unchanged)
    }
}

/// 本地 Agent 集合
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AgentCollection {
    agents: Vec<AgentRecord>,
}

impl AgentCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 应用一个事件
    pub fn apply(&mut self, event: StreamEvent) -> Change {
        match event {
            StreamEvent::Initial { agents } => {
                self.agents = Vec::with_capacity(agents.len());
                // initial 内部若有重复 id，后出现的覆盖先出现的
                for agent in agents {
                    self.upsert(agent);
                }
                Change::Replaced {
                    count: self.agents.len(),
                }
            }

            // 已存在的 id 原地替换，保证每个 id 至多一条
            StreamEvent::Spawn { agent } => match self.position(&agent.id) {
                Some(idx) => {
                    tracing::debug!("spawn 的 id 已存在，原地替换: id={}", agent.id);
                    self.agents[idx] = agent;
                    Change::Updated
                }
                None => {
                    self.agents.push(agent);
                    Change::Added
                }
            },

            StreamEvent::Update { agent } => match self.position(&agent.id) {
                Some(idx) => {
                    self.agents[idx] = agent;
                    Change::Updated
                }
                None => {
                    tracing::debug!("update 的 id 不存在，丢弃: id={}", agent.id);
                    Change::Unchanged
                }
            },

            StreamEvent::Remove { agent_id } => match self.position(&agent_id) {
                Some(idx) => {
                    self.agents.remove(idx);
                    Change::Removed
                }
                None => Change::Unchanged,
            },
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.agents.iter().position(|a| a.id == id)
    }

    fn upsert(&mut self, agent: AgentRecord) {
        match self.position(&agent.id) {
            Some(idx) => self.agents[idx] = agent,
            None => self.agents.push(agent),
        }
    }

    /// 所有记录（只读）
    pub fn as_slice(&self) -> &[AgentRecord] {
        &self.agents
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AgentRecord> {
        self.agents.iter()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// 按 id 查找
    pub fn get(&self, id: &str) -> Option<&AgentRecord> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// 直接子 Agent
    pub fn children_of<'a>(&'a self, parent_id: &'a str) -> impl Iterator<Item = &'a AgentRecord> + 'a {
        self.agents
            .iter()
            .filter(move |a| a.parent_id.as_deref() == Some(parent_id))
    }

    /// 根节点：没有父引用，或父记录已不在集合中
    pub fn roots(&self) -> Vec<&AgentRecord> {
        self.agents
            .iter()
            .filter(|a| match a.parent_id.as_deref() {
                None => true,
                Some(parent) => self.get(parent).is_none(),
            })
            .collect()
    }

    /// 按状态计数
    pub fn count_by_status(&self) -> HashMap<AgentStatus, usize> {
        let mut counts = HashMap::new();
        for agent in &self.agents {
            *counts.entry(agent.status).or_insert(0) += 1;
        }
        counts
    }

    /// 仍在运行（未结束）的 Agent 数量
    pub fn running_count(&self) -> usize {
        self.agents.iter().filter(|a| !a.is_finished()).count()
    }
}

impl<'a> IntoIterator for &'a AgentCollection {
    type Item = &'a AgentRecord;
    type IntoIter = std::slice::Iter<'a, AgentRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.agents.iter()
    }
}
