//! # 调度器
//!
//! 依赖感知的并发任务调度。objective 经规划器分解为任务图，
//! 协调循环串行消费消息并派发就绪任务，执行并发由信号量约束。
//!
//! ## 架构
//! 所有可变调度状态（任务图、agent 注册表、在途表）归协调循环独占，
//! 不加锁。外部通过 [`Orchestrator`] 的方法与之通信，执行任务
//! 以 [`TaskFinished`] 消息回报，事件经 broadcast 对外扇出。

pub mod dag;
pub mod events;
pub mod executor;
pub mod matcher;
pub mod planner;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::TtlCache;
use crate::config::EngineConfig;
use crate::error::{HiveError, Result};
use crate::fileops::AsyncFileManager;
use crate::history::ExecutionHistory;
use crate::pool::{ConnectionPool, RemoteConnector};
use crate::types::{
    Agent, AgentId, EngineStatus, ObjectiveId, Task, TaskErrorDetail, TaskId, TaskStatus,
};

pub use dag::TaskGraph;
pub use events::{EngineEvent, Message, MetricsSnapshot, TaskFinished};
pub use executor::{ExecutorConfig, ExecutorStats, TaskRunner};
pub use matcher::AgentRegistry;
pub use planner::{ObjectivePlanner, SingleTaskPlanner, TaskSpec};

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 同时执行的任务上限
    pub max_concurrent_tasks: usize,
    /// 派发轮询间隔
    pub dispatch_interval: Duration,
    /// 指标广播间隔
    pub metrics_interval: Duration,
    /// 内部消息通道容量
    pub queue_capacity: usize,
    /// 事件广播通道容量
    pub event_capacity: usize,
    /// 执行历史环形缓冲容量
    pub history_capacity: usize,
    pub executor: ExecutorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            dispatch_interval: Duration::from_millis(100),
            metrics_interval: Duration::from_secs(5),
            queue_capacity: 256,
            event_capacity: 256,
            history_capacity: 1000,
            executor: ExecutorConfig::default(),
        }
    }
}

/// 引擎入口
///
/// 持有各组件的共享句柄，对外暴露提交 / 查询 / 订阅 / 关闭。
/// Clone 语义通过 `Arc<Orchestrator>` 获得。
pub struct Orchestrator {
    tx: mpsc::Sender<Message>,
    events: broadcast::Sender<EngineEvent>,
    pool: Arc<ConnectionPool>,
    cache: Arc<TtlCache>,
    files: Arc<AsyncFileManager>,
    history: ExecutionHistory,
    runner: Arc<TaskRunner>,
    planner: Arc<dyn ObjectivePlanner>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// 启动引擎：预热连接池、起后台清扫、拉起协调循环
    pub async fn start(
        config: EngineConfig,
        connector: Arc<dyn RemoteConnector>,
    ) -> Result<Arc<Self>> {
        Self::start_with_planner(config, connector, Arc::new(SingleTaskPlanner)).await
    }

    pub async fn start_with_planner(
        config: EngineConfig,
        connector: Arc<dyn RemoteConnector>,
        planner: Arc<dyn ObjectivePlanner>,
    ) -> Result<Arc<Self>> {
        let pool = ConnectionPool::connect(connector, config.pool)
            .await
            .map_err(HiveError::Pool)?;
        let cache = Arc::new(TtlCache::new(config.cache));
        cache.start_sweep(None);
        let files = Arc::new(AsyncFileManager::new(config.files));
        let history = ExecutionHistory::new(config.scheduler.history_capacity);

        let runner = Arc::new(TaskRunner::new(
            pool.clone(),
            cache.clone(),
            history.clone(),
            files.clone(),
            config.scheduler.executor.clone(),
        ));

        let (tx, rx) = mpsc::channel(config.scheduler.queue_capacity);
        let (events, _) = broadcast::channel(config.scheduler.event_capacity);

        let coordinator = Coordinator {
            config: config.scheduler.clone(),
            registry: AgentRegistry::new(),
            objectives: HashMap::new(),
            finished_objectives: HashSet::new(),
            completed: HashSet::new(),
            active: HashMap::new(),
            completed_count: 0,
            failed_count: 0,
            slots: Arc::new(Semaphore::new(config.scheduler.max_concurrent_tasks.max(1))),
            runner: runner.clone(),
            pool: pool.clone(),
            cache: cache.clone(),
            tx: tx.clone(),
            events: events.clone(),
            shutting_down: false,
            shutdown_reply: None,
        };
        let loop_handle = tokio::spawn(coordinator.run(rx));

        info!(
            max_concurrent = config.scheduler.max_concurrent_tasks,
            "Orchestrator started"
        );

        Ok(Arc::new(Self {
            tx,
            events,
            pool,
            cache,
            files,
            history,
            runner,
            planner,
            loop_handle: Mutex::new(Some(loop_handle)),
        }))
    }

    /// 提交一个 objective：规划器分解后整体入图
    pub async fn submit_objective(&self, objective: &str) -> Result<ObjectiveId> {
        let objective_id = uuid::Uuid::new_v4().to_string();
        let specs = self.planner.plan(objective).await?;
        if specs.is_empty() {
            return Err(HiveError::invalid_input("planner produced no tasks"));
        }
        let tasks = TaskSpec::materialize(specs, &objective_id)?;
        self.submit_tasks(objective_id, tasks).await
    }

    /// 提交预先构建的任务集合
    ///
    /// 环或悬空依赖会使整个 objective 被拒绝，不会部分入队。
    pub async fn submit_tasks(
        &self,
        objective_id: ObjectiveId,
        tasks: Vec<Task>,
    ) -> Result<ObjectiveId> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::SubmitObjective {
            objective_id,
            tasks,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HiveError::ShuttingDown)?
    }

    pub async fn register_agent(&self, agent: Agent) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::RegisterAgent { agent, reply }).await?;
        rx.await.map_err(|_| HiveError::ShuttingDown)?
    }

    pub async fn unregister_agent(&self, agent_id: AgentId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::UnregisterAgent { agent_id, reply })
            .await?;
        rx.await.map_err(|_| HiveError::ShuttingDown)?
    }

    pub async fn get_status(&self) -> Result<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::GetStatus { reply }).await?;
        rx.await.map_err(|_| HiveError::ShuttingDown)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::GetTask { task_id, reply }).await?;
        rx.await.map_err(|_| HiveError::ShuttingDown)
    }

    /// 订阅引擎事件
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    pub fn files(&self) -> &Arc<AsyncFileManager> {
        &self.files
    }

    pub fn history(&self) -> &ExecutionHistory {
        &self.history
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.runner.stats()
    }

    /// 优雅关闭
    ///
    /// 顺序：停止派发并等在途任务 -> 排空文件操作 -> 排空连接池 ->
    /// 销毁缓存后台任务。重复调用安全。
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.events.send(EngineEvent::ShuttingDown);

        let (reply, rx) = oneshot::channel();
        if self.send(Message::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        if let Some(handle) = self.loop_handle.lock().take() {
            let _ = handle.await;
        }

        self.files.wait_for_pending().await;
        self.pool.drain().await;
        self.cache.destroy();
        info!("Orchestrator shut down");
        Ok(())
    }

    async fn send(&self, msg: Message) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| HiveError::ShuttingDown)
    }
}

/// 协调循环：独占全部调度状态
struct Coordinator {
    config: SchedulerConfig,
    registry: AgentRegistry,
    objectives: HashMap<ObjectiveId, TaskGraph>,
    finished_objectives: HashSet<ObjectiveId>,
    /// 已成功完成的任务 id，用于就绪判定
    completed: HashSet<TaskId>,
    /// task -> 执行它的 agent
    active: HashMap<TaskId, AgentId>,
    completed_count: usize,
    failed_count: usize,
    slots: Arc<Semaphore>,
    runner: Arc<TaskRunner>,
    pool: Arc<ConnectionPool>,
    cache: Arc<TtlCache>,
    tx: mpsc::Sender<Message>,
    events: broadcast::Sender<EngineEvent>,
    shutting_down: bool,
    shutdown_reply: Option<oneshot::Sender<Result<()>>>,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        let mut dispatch_tick = tokio::time::interval(self.config.dispatch_interval);
        dispatch_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut metrics_tick = tokio::time::interval(self.config.metrics_interval);
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => {
                            self.handle(msg);
                            self.dispatch();
                            if self.try_finish_shutdown() {
                                break;
                            }
                        }
                        // 所有发送端已关闭
                        None => break,
                    }
                }
                _ = dispatch_tick.tick() => {
                    self.dispatch();
                    if self.try_finish_shutdown() {
                        break;
                    }
                }
                _ = metrics_tick.tick() => {
                    let _ = self.events.send(EngineEvent::MetricsTick(self.metrics()));
                }
            }
        }
        debug!("Coordinator loop exited");
    }

    fn handle(&mut self, msg: Message) {
        match msg {
            Message::SubmitObjective {
                objective_id,
                tasks,
                reply,
            } => {
                let _ = reply.send(self.submit(objective_id, tasks));
            }
            Message::RegisterAgent { agent, reply } => {
                let agent_id = agent.id.clone();
                let outcome = self.registry.register(agent);
                if outcome.is_ok() {
                    let _ = self.events.send(EngineEvent::AgentRegistered {
                        agent_id: agent_id.clone(),
                    });
                }
                let _ = reply.send(outcome);
            }
            Message::UnregisterAgent { agent_id, reply } => {
                let outcome = self.registry.unregister(&agent_id).map(|_| ());
                if outcome.is_ok() {
                    let _ = self
                        .events
                        .send(EngineEvent::AgentUnregistered { agent_id });
                }
                let _ = reply.send(outcome);
            }
            Message::TaskFinished(finished) => self.on_task_finished(finished),
            Message::GetStatus { reply } => {
                let _ = reply.send(self.status());
            }
            Message::GetTask { task_id, reply } => {
                let task = self
                    .objectives
                    .values()
                    .find_map(|g| g.get(&task_id))
                    .cloned();
                let _ = reply.send(task);
            }
            Message::Shutdown { reply } => {
                info!(active = self.active.len(), "Scheduler draining");
                self.shutting_down = true;
                self.shutdown_reply = Some(reply);
            }
        }
    }

    fn submit(&mut self, objective_id: ObjectiveId, tasks: Vec<Task>) -> Result<ObjectiveId> {
        if self.shutting_down {
            return Err(HiveError::ShuttingDown);
        }
        if self.objectives.contains_key(&objective_id) {
            return Err(HiveError::already_exists(format!(
                "objective {}",
                objective_id
            )));
        }

        let task_count = tasks.len();
        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        let graph = TaskGraph::build(tasks)?;

        info!(objective_id = %objective_id, task_count, "Objective submitted");
        let _ = self.events.send(EngineEvent::ObjectiveSubmitted {
            objective_id: objective_id.clone(),
            task_count,
        });
        for task_id in task_ids {
            let _ = self.events.send(EngineEvent::TaskQueued { task_id });
        }

        self.objectives.insert(objective_id.clone(), graph);
        Ok(objective_id)
    }

    /// 派发就绪任务，直到没有就绪任务、没有空闲 agent 或并发槽用尽
    fn dispatch(&mut self) {
        if self.shutting_down {
            return;
        }

        // 先收集候选再逐个路由，避免边遍历边改图
        let ready: Vec<(ObjectiveId, TaskId)> = self
            .objectives
            .iter()
            .flat_map(|(oid, graph)| {
                graph
                    .ready_tasks(&self.completed)
                    .into_iter()
                    .map(|t| (oid.clone(), t.id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        for (objective_id, task_id) in ready {
            let Some(task) = self
                .objectives
                .get(&objective_id)
                .and_then(|g| g.get(&task_id))
                .cloned()
            else {
                continue;
            };

            let agent_id = match self.registry.select(&task) {
                Ok(Some(agent_id)) => agent_id,
                // 有能胜任的 agent 但都在忙，下一轮再试
                Ok(None) => continue,
                Err(err) => {
                    self.fail_task(
                        &objective_id,
                        &task_id,
                        TaskErrorDetail::terminal(err.to_string()),
                    );
                    continue;
                }
            };

            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                // 并发槽满，本轮到此为止
                break;
            };

            self.registry.set_available(&agent_id, false);
            if let Some(task) = self
                .objectives
                .get_mut(&objective_id)
                .and_then(|g| g.get_mut(&task_id))
            {
                task.status = TaskStatus::Running;
                task.assigned_agent = Some(agent_id.clone());
                task.started_at = Some(chrono::Utc::now());
            }
            self.active.insert(task_id.clone(), agent_id.clone());

            debug!(task_id = %task_id, agent_id = %agent_id, "Task dispatched");
            let _ = self.events.send(EngineEvent::TaskStarted {
                task_id: task_id.clone(),
                agent_id: agent_id.clone(),
            });

            let runner = self.runner.clone();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let finished = runner.run(task, agent_id).await;
                // 协调循环先退出属于关闭路径，结果可以丢
                if tx.send(Message::TaskFinished(finished)).await.is_err() {
                    warn!("Coordinator gone, dropping task result");
                }
                drop(permit);
            });
        }
    }

    fn on_task_finished(&mut self, finished: TaskFinished) {
        let TaskFinished {
            task_id,
            objective_id,
            agent_id,
            duration_ms,
            result,
            from_cache,
        } = finished;

        self.active.remove(&task_id);
        let success = result.is_ok();
        if let Some(agent) = self.registry.get_mut(&agent_id) {
            agent.available = true;
            agent.metrics.record(duration_ms, success);
        }

        let mut downstream_failed = Vec::new();
        if let Some(graph) = self.objectives.get_mut(&objective_id) {
            match result {
                Ok(value) => {
                    if let Some(task) = graph.get_mut(&task_id) {
                        let now = chrono::Utc::now();
                        task.status = TaskStatus::Completed;
                        task.result = Some(value);
                        task.completed_at = Some(now);
                        task.attempts.push(crate::types::TaskAttempt {
                            agent_id: agent_id.clone(),
                            started_at: task.started_at.unwrap_or(now),
                            finished_at: now,
                            success: true,
                            error: None,
                        });
                    }
                    self.completed.insert(task_id.clone());
                    self.completed_count += 1;
                    let _ = self.events.send(EngineEvent::TaskCompleted {
                        task_id: task_id.clone(),
                        agent_id,
                        duration_ms,
                        from_cache,
                    });
                }
                Err(detail) => {
                    if let Some(task) = graph.get_mut(&task_id) {
                        let now = chrono::Utc::now();
                        task.status = TaskStatus::Failed;
                        task.error = Some(detail.clone());
                        task.completed_at = Some(now);
                        task.attempts.push(crate::types::TaskAttempt {
                            agent_id: agent_id.clone(),
                            started_at: task.started_at.unwrap_or(now),
                            finished_at: now,
                            success: false,
                            error: Some(detail.message.clone()),
                        });
                    }
                    self.failed_count += 1;
                    error!(task_id = %task_id, error = %detail.message, "Task failed");
                    let _ = self.events.send(EngineEvent::TaskFailed {
                        task_id: task_id.clone(),
                        error: detail.clone(),
                    });
                    // 下游任务级联失败
                    downstream_failed = graph.fail_downstream(&task_id);
                }
            }
        }
        for (failed_id, detail) in downstream_failed {
            self.failed_count += 1;
            let _ = self.events.send(EngineEvent::TaskFailed {
                task_id: failed_id,
                error: detail,
            });
        }

        self.check_objective_done(&objective_id);
    }

    fn fail_task(&mut self, objective_id: &ObjectiveId, task_id: &TaskId, detail: TaskErrorDetail) {
        let mut downstream_failed = Vec::new();
        if let Some(graph) = self.objectives.get_mut(objective_id) {
            if let Some(task) = graph.get_mut(task_id) {
                task.status = TaskStatus::Failed;
                task.error = Some(detail.clone());
                task.completed_at = Some(chrono::Utc::now());
            }
            downstream_failed = graph.fail_downstream(task_id);
        }
        self.failed_count += 1;
        error!(task_id = %task_id, error = %detail.message, "Task unroutable");
        let _ = self.events.send(EngineEvent::TaskFailed {
            task_id: task_id.clone(),
            error: detail,
        });
        for (failed_id, detail) in downstream_failed {
            self.failed_count += 1;
            let _ = self.events.send(EngineEvent::TaskFailed {
                task_id: failed_id,
                error: detail,
            });
        }
        self.check_objective_done(objective_id);
    }

    fn check_objective_done(&mut self, objective_id: &ObjectiveId) {
        if self.finished_objectives.contains(objective_id) {
            return;
        }
        let Some(graph) = self.objectives.get(objective_id) else {
            return;
        };
        if !graph.all_terminal() {
            return;
        }
        let success = graph.tasks().all(|t| t.status == TaskStatus::Completed);
        self.finished_objectives.insert(objective_id.clone());
        info!(objective_id = %objective_id, success, "Objective finished");
        let _ = self.events.send(EngineEvent::ObjectiveCompleted {
            objective_id: objective_id.clone(),
            success,
        });
    }

    /// 关闭流程：在途任务清零后答复并退出
    fn try_finish_shutdown(&mut self) -> bool {
        if !self.shutting_down {
            return false;
        }
        if !self.active.is_empty() {
            return false;
        }
        if let Some(reply) = self.shutdown_reply.take() {
            let _ = reply.send(Ok(()));
        }
        true
    }

    fn status(&self) -> EngineStatus {
        let queued = self
            .objectives
            .values()
            .flat_map(|g| g.tasks())
            .filter(|t| !t.status.is_terminal() && t.status != TaskStatus::Running)
            .count();
        EngineStatus {
            queued_tasks: queued,
            active_tasks: self.active.len(),
            completed_tasks: self.completed_count,
            failed_tasks: self.failed_count,
            total_agents: self.registry.len(),
            active_agents: self.registry.available_count(),
        }
    }

    fn metrics(&self) -> MetricsSnapshot {
        let pool = self.pool.stats();
        MetricsSnapshot {
            queued_tasks: self.status().queued_tasks,
            active_tasks: self.active.len(),
            completed_tasks: self.completed_count as u64,
            failed_tasks: self.failed_count as u64,
            cache_hit_rate: self.cache.metrics().hit_rate,
            pool_in_use: pool.in_use,
            pool_idle: pool.idle,
        }
    }
}
