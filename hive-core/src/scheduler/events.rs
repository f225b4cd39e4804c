//! # 调度器消息与事件
//!
//! 内部协调走单条 mpsc 通道（[`Message`]），所有状态变更由协调循环
//! 串行消费，执行侧不持锁回写。对外观测走 broadcast（[`EngineEvent`]），
//! 订阅者掉队丢事件不影响引擎本身。

use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::types::{Agent, AgentId, ObjectiveId, Task, TaskErrorDetail, TaskId};

/// 任务执行的完成回报
#[derive(Debug)]
pub struct TaskFinished {
    pub task_id: TaskId,
    pub objective_id: ObjectiveId,
    pub agent_id: AgentId,
    pub duration_ms: u64,
    pub result: std::result::Result<serde_json::Value, TaskErrorDetail>,
    pub from_cache: bool,
}

/// 协调循环消费的内部消息
pub enum Message {
    /// 提交一组任务作为新 objective
    SubmitObjective {
        objective_id: ObjectiveId,
        tasks: Vec<Task>,
        reply: oneshot::Sender<Result<ObjectiveId>>,
    },
    /// 注册 agent
    RegisterAgent {
        agent: Agent,
        reply: oneshot::Sender<Result<()>>,
    },
    /// 注销 agent
    UnregisterAgent {
        agent_id: AgentId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// 执行完成（由执行任务回报，成功或失败）
    TaskFinished(TaskFinished),
    /// 查询引擎状态
    GetStatus {
        reply: oneshot::Sender<crate::types::EngineStatus>,
    },
    /// 查询单个任务
    GetTask {
        task_id: TaskId,
        reply: oneshot::Sender<Option<Task>>,
    },
    /// 优雅关闭：停止派发，等在途任务结束
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::SubmitObjective { objective_id, tasks, .. } => f
                .debug_struct("SubmitObjective")
                .field("objective_id", objective_id)
                .field("tasks", &tasks.len())
                .finish(),
            Message::RegisterAgent { agent, .. } => f
                .debug_struct("RegisterAgent")
                .field("agent_id", &agent.id)
                .finish(),
            Message::UnregisterAgent { agent_id, .. } => f
                .debug_struct("UnregisterAgent")
                .field("agent_id", agent_id)
                .finish(),
            Message::TaskFinished(finished) => f
                .debug_struct("TaskFinished")
                .field("task_id", &finished.task_id)
                .finish(),
            Message::GetStatus { .. } => f.write_str("GetStatus"),
            Message::GetTask { task_id, .. } => {
                f.debug_struct("GetTask").field("task_id", task_id).finish()
            }
            Message::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

/// 对外广播的引擎事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ObjectiveSubmitted {
        objective_id: ObjectiveId,
        task_count: usize,
    },
    ObjectiveCompleted {
        objective_id: ObjectiveId,
        success: bool,
    },
    TaskQueued {
        task_id: TaskId,
    },
    TaskStarted {
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: AgentId,
        duration_ms: u64,
        from_cache: bool,
    },
    TaskFailed {
        task_id: TaskId,
        error: TaskErrorDetail,
    },
    AgentRegistered {
        agent_id: AgentId,
    },
    AgentUnregistered {
        agent_id: AgentId,
    },
    MetricsTick(MetricsSnapshot),
    ShuttingDown,
}

/// 周期性指标快照，随 [`EngineEvent::MetricsTick`] 广播
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub queued_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cache_hit_rate: f64,
    pub pool_in_use: usize,
    pub pool_idle: usize,
}
