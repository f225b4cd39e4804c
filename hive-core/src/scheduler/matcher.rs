//! # Agent 匹配器
//!
//! 按能力集为任务挑选 agent。打分公式：
//! 每个命中的能力 +10，可靠性（成功率）x5，速度分 x3。
//! 并列时取 id 最小的 agent，结果确定可复现。

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{HiveError, Result};
use crate::types::{Agent, AgentId, Task};

/// Agent 注册表
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<AgentId, Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Agent) -> Result<()> {
        if self.agents.contains_key(&agent.id) {
            return Err(HiveError::already_exists(format!("agent {}", agent.id)));
        }
        debug!(agent_id = %agent.id, capabilities = ?agent.capabilities, "Agent registered");
        self.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    pub fn unregister(&mut self, id: &AgentId) -> Result<Agent> {
        self.agents
            .remove(id)
            .ok_or_else(|| HiveError::not_found(format!("agent {}", id)))
    }

    pub fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn get_mut(&mut self, id: &AgentId) -> Option<&mut Agent> {
        self.agents.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.agents.values().filter(|a| a.available).count()
    }

    /// 为任务选择得分最高的可用 agent
    ///
    /// 区分两种失败：
    /// - 注册表里没有任何 agent 具备全部所需能力 -> [`HiveError::Unroutable`]，
    ///   这个任务永远派不出去，应当终止而非等待
    /// - 有能胜任的 agent 但当前都在忙 -> `Ok(None)`，下一轮调度再试
    pub fn select(&self, task: &Task) -> Result<Option<AgentId>> {
        let capable: Vec<&Agent> = self
            .agents
            .values()
            .filter(|a| a.can_handle(task))
            .collect();

        if capable.is_empty() {
            let missing: Vec<String> = task.required_capabilities.iter().cloned().collect();
            warn!(task_id = %task.id, missing = ?missing, "No capable agent registered");
            return Err(HiveError::Unroutable {
                task_id: task.id.clone(),
                missing,
            });
        }

        let best = capable
            .into_iter()
            .filter(|a| a.available)
            .map(|a| (Self::score(a, task), a))
            .max_by(|(sa, a), (sb, b)| {
                // 分数高者优先，分数相同取 id 小者
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|(score, a)| {
                debug!(task_id = %task.id, agent_id = %a.id, score, "Agent matched");
                a.id.clone()
            });

        Ok(best)
    }

    fn score(agent: &Agent, task: &Task) -> f64 {
        let matched = task
            .required_capabilities
            .iter()
            .filter(|c| agent.capabilities.contains(*c))
            .count() as f64;
        matched * 10.0 + agent.metrics.reliability * 5.0 + agent.metrics.speed * 3.0
    }

    pub fn set_available(&mut self, id: &AgentId, available: bool) {
        if let Some(agent) = self.agents.get_mut(id) {
            agent.available = available;
        }
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }
}
