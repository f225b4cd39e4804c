//! # 任务依赖图
//!
//! 维护 objective 内任务的依赖关系，入队前做环检测，
//! 运行期回答"哪些任务已就绪"。

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::debug;

use crate::error::{HiveError, Result};
use crate::types::{Task, TaskErrorDetail, TaskId, TaskStatus};

/// 一个 objective 的任务集合及其依赖边
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    /// task -> 它依赖的任务
    edges: HashMap<TaskId, HashSet<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从任务列表构建图并校验
    ///
    /// 校验两件事：依赖必须指向图内存在的任务；不允许出现环。
    /// 任一失败则整个 objective 被拒绝；校验通过的任务全部
    /// 进入 `Queued` 状态（created -> queued 在入图时发生）。
    pub fn build(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = Self::new();
        for task in tasks {
            graph.insert(task)?;
        }
        graph.validate()?;
        for task in graph.tasks.values_mut() {
            task.status = TaskStatus::Queued;
        }
        Ok(graph)
    }

    fn insert(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(HiveError::already_exists(format!("task {}", task.id)));
        }
        self.edges
            .insert(task.id.clone(), task.dependencies.iter().cloned().collect());
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        // 悬空依赖
        for (id, deps) in &self.edges {
            for dep in deps {
                if !self.tasks.contains_key(dep) {
                    return Err(HiveError::invalid_input(format!(
                        "task {} depends on unknown task {}",
                        id, dep
                    )));
                }
            }
        }
        self.detect_cycle()
    }

    /// DFS 环检测，rec_stack 记录当前递归路径
    fn detect_cycle(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for id in self.tasks.keys() {
            if !visited.contains(id) {
                self.dfs(id, &mut visited, &mut rec_stack, &mut path)?;
            }
        }
        Ok(())
    }

    fn dfs(
        &self,
        id: &TaskId,
        visited: &mut HashSet<TaskId>,
        rec_stack: &mut HashSet<TaskId>,
        path: &mut Vec<TaskId>,
    ) -> Result<()> {
        visited.insert(id.clone());
        rec_stack.insert(id.clone());
        path.push(id.clone());

        if let Some(deps) = self.edges.get(id) {
            for dep in deps {
                if rec_stack.contains(dep) {
                    // 截取路径中从 dep 开始的部分作为环
                    let start = path.iter().position(|t| t == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Err(HiveError::CycleDetected(cycle));
                }
                if !visited.contains(dep) {
                    self.dfs(dep, visited, rec_stack, path)?;
                }
            }
        }

        rec_stack.remove(id);
        path.pop();
        Ok(())
    }

    /// 所有依赖均已完成、且仍在排队的任务
    pub fn ready_tasks(&self, completed: &HashSet<TaskId>) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && t.dependencies_satisfied(completed))
            .collect();
        // 高优先级在前，同级按 id 保证确定性
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        ready
    }

    /// 某任务失败后，传递性地标记所有下游任务失败
    ///
    /// 每个受影响的任务记录一条指明直接上游的终态错误并写入完成时间，
    /// 返回 (任务 id, 错误详情) 供调用方广播。
    pub fn fail_downstream(&mut self, failed: &TaskId) -> Vec<(TaskId, TaskErrorDetail)> {
        let mut affected = Vec::new();
        let mut frontier = vec![failed.clone()];
        while let Some(current) = frontier.pop() {
            for (id, deps) in &self.edges {
                if deps.contains(&current) {
                    if let Some(task) = self.tasks.get_mut(id) {
                        if !task.status.is_terminal() {
                            let detail = TaskErrorDetail::terminal(format!(
                                "upstream task {} failed",
                                current
                            ));
                            task.status = TaskStatus::Failed;
                            task.error = Some(detail.clone());
                            task.completed_at = Some(Utc::now());
                            debug!(task_id = %id, upstream = %current, "Task failed by upstream dependency");
                            affected.push((id.clone(), detail));
                            frontier.push(id.clone());
                        }
                    }
                }
            }
        }
        affected
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 是否所有任务都已到达终态
    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }
}
