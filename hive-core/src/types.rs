//! Core domain types shared across the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub type TaskId = String;
pub type AgentId = String;
pub type ObjectiveId = String;

/// Task lifecycle states. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum TaskStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, PartialOrd, Ord, Default, Hash)]
pub enum TaskPriority {
    Critical = 4,
    High = 3,
    #[default]
    Medium = 2,
    Low = 1,
}

/// One execution attempt of a task, kept for caller-driven retry decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub agent_id: AgentId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// Classification attached to a failed task so the caller can decide
/// whether re-submission makes sense.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorDetail {
    pub message: String,
    /// Transient fault (network, rate limit, timeout)
    pub recoverable: bool,
    /// A re-submission with backoff is a reasonable response
    pub retryable: bool,
}

impl TaskErrorDetail {
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            recoverable: false,
            retryable: false,
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
            recoverable: true,
            retryable: true,
        }
    }
}

/// A unit of schedulable work with dependencies and a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub objective_id: ObjectiveId,
    pub name: String,
    pub description: String,
    pub task_type: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    pub dependents: Vec<TaskId>,
    pub required_capabilities: Vec<String>,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskErrorDetail>,
    pub metadata: HashMap<String, String>,
    pub assigned_agent: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: Vec<TaskAttempt>,
}

impl Task {
    pub fn new(
        id: impl Into<TaskId>,
        objective_id: impl Into<ObjectiveId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            objective_id: objective_id.into(),
            name: name.into(),
            description: String::new(),
            task_type: "generic".to_string(),
            priority: TaskPriority::default(),
            status: TaskStatus::Created,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            required_capabilities: Vec::new(),
            input: serde_json::Value::Null,
            result: None,
            error: None,
            metadata: HashMap::new(),
            assigned_agent: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.required_capabilities = caps;
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn dependencies_satisfied(&self, completed: &HashSet<TaskId>) -> bool {
        self.dependencies.iter().all(|dep| completed.contains(dep))
    }
}

/// A worker entity capable of executing tasks matching its declared
/// capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub capabilities: HashSet<String>,
    pub available: bool,
    pub metrics: AgentMetrics,
}

impl Agent {
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: HashSet::new(),
            available: true,
            metrics: AgentMetrics::default(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn can_handle(&self, task: &Task) -> bool {
        task.required_capabilities
            .iter()
            .all(|cap| self.capabilities.contains(cap))
    }
}

/// Rolling performance metrics per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// 0.0 - 1.0, success ratio
    pub reliability: f64,
    /// 0.0 - 1.0, exponentially weighted, higher is faster
    pub speed: f64,
    pub avg_duration_ms: f64,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            // New agents start with neutral-optimistic scores so they get work
            reliability: 1.0,
            speed: 0.5,
            avg_duration_ms: 0.0,
        }
    }
}

impl AgentMetrics {
    /// Fold one finished task into the rolling scores.
    pub fn record(&mut self, duration_ms: u64, success: bool) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }

        let total = (self.tasks_completed + self.tasks_failed) as f64;
        self.reliability = self.tasks_completed as f64 / total;
        self.avg_duration_ms =
            (self.avg_duration_ms * (total - 1.0) + duration_ms as f64) / total;

        // EWMA toward 1.0 for sub-second tasks, toward 0.0 for minute-scale ones
        let sample = 1.0 / (1.0 + duration_ms as f64 / 10_000.0);
        self.speed = self.speed * 0.8 + sample * 0.2;
    }
}

/// Caller-facing status snapshot of the whole engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStatus {
    pub queued_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub total_agents: usize,
    pub active_agents: usize,
}
