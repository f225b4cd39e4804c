//! # Objective 规划器
//!
//! 把一个 objective 描述分解为任务列表。分解策略放在 trait 后面，
//! 默认实现是单任务直通；接 LLM 或规则引擎时只换实现不动调度器。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ObjectiveId, Task, TaskPriority};

/// 规划产物：尚未绑定 objective 的任务描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
    /// 引用同批 TaskSpec 的下标
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            task_type: String::new(),
            priority: TaskPriority::default(),
            depends_on: Vec::new(),
            required_capabilities: Vec::new(),
            input: serde_json::Value::Null,
        }
    }

    /// 落地为具体任务，下标依赖换算成任务 id
    pub fn materialize(specs: Vec<TaskSpec>, objective_id: &ObjectiveId) -> Result<Vec<Task>> {
        let ids: Vec<String> = (0..specs.len())
            .map(|i| format!("{}-t{}", objective_id, i))
            .collect();

        specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                let mut deps = Vec::with_capacity(spec.depends_on.len());
                for idx in &spec.depends_on {
                    let dep = ids.get(*idx).ok_or_else(|| {
                        crate::error::HiveError::invalid_input(format!(
                            "task {} depends on out-of-range index {}",
                            spec.name, idx
                        ))
                    })?;
                    deps.push(dep.clone());
                }
                let mut task = Task::new(ids[i].clone(), objective_id.clone(), spec.name)
                    .with_description(spec.description)
                    .with_priority(spec.priority)
                    .with_dependencies(deps)
                    .with_capabilities(spec.required_capabilities)
                    .with_input(spec.input);
                if !spec.task_type.is_empty() {
                    task = task.with_type(spec.task_type);
                }
                Ok(task)
            })
            .collect()
    }
}

/// Objective 分解接口
#[async_trait]
pub trait ObjectivePlanner: Send + Sync {
    async fn plan(&self, objective: &str) -> Result<Vec<TaskSpec>>;
}

/// 默认规划器：整个 objective 作为一个任务
pub struct SingleTaskPlanner;

#[async_trait]
impl ObjectivePlanner for SingleTaskPlanner {
    async fn plan(&self, objective: &str) -> Result<Vec<TaskSpec>> {
        Ok(vec![TaskSpec::new("objective", objective)])
    }
}
