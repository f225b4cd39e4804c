//! # 任务执行器
//!
//! 单个任务的完整执行路径：查结果缓存 -> 走连接池调远端 -> 分类错误 ->
//! 回填缓存 -> 记历史 -> 尽力持久化。执行器不碰调度状态，
//! 结果以 [`TaskFinished`] 回报协调循环。

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::fileops::AsyncFileManager;
use crate::history::{ExecutionHistory, HistoryRecord};
use crate::pool::{ConnectionPool, PoolError};
use crate::scheduler::events::TaskFinished;
use crate::types::{AgentId, Task, TaskErrorDetail};

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 单任务执行超时
    pub task_timeout: Duration,
    /// 超过该耗时的任务记 warn
    pub slow_task_threshold: Duration,
    /// 是否缓存成功结果
    pub cache_results: bool,
    /// 结果缓存 TTL，None 用缓存默认值
    pub result_ttl: Option<Duration>,
    /// 任务结果落盘目录，None 关闭持久化
    pub persist_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(300),
            slow_task_threshold: Duration::from_secs(60),
            cache_results: true,
            result_ttl: None,
            persist_dir: None,
        }
    }
}

/// 执行统计快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub timeouts: u64,
}

/// 落盘的结果摘要
#[derive(Serialize)]
struct PersistedResult<'a> {
    task_id: &'a str,
    agent_id: &'a str,
    success: bool,
    duration_ms: u64,
    result: Option<&'a serde_json::Value>,
    error: Option<&'a TaskErrorDetail>,
}

pub struct TaskRunner {
    pool: Arc<ConnectionPool>,
    cache: Arc<TtlCache>,
    history: ExecutionHistory,
    files: Arc<AsyncFileManager>,
    config: ExecutorConfig,
    executed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    timeouts: AtomicU64,
}

impl TaskRunner {
    pub fn new(
        pool: Arc<ConnectionPool>,
        cache: Arc<TtlCache>,
        history: ExecutionHistory,
        files: Arc<AsyncFileManager>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pool,
            cache,
            history,
            files,
            config,
            executed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// 内容寻址的缓存键：类型 + 描述 + 入参 + 排序后的元数据
    ///
    /// 不含 task id，同样内容的任务跨 objective 命中同一条缓存。
    pub fn cache_key(task: &Task) -> String {
        let mut hasher = Sha256::new();
        hasher.update(task.task_type.as_bytes());
        hasher.update(b"\n");
        hasher.update(task.description.as_bytes());
        hasher.update(b"\n");
        hasher.update(task.input.to_string().as_bytes());
        let mut meta: Vec<_> = task.metadata.iter().collect();
        meta.sort_by_key(|(k, _)| k.clone());
        for (k, v) in meta {
            hasher.update(b"\n");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        format!("task:{:x}", hasher.finalize())
    }

    /// 执行一个任务并回报结果，从不 panic、不向上抛错
    pub async fn run(&self, task: Task, agent_id: AgentId) -> TaskFinished {
        let started = Instant::now();
        self.executed.fetch_add(1, Ordering::Relaxed);

        // 缓存命中直接短路，不占连接
        if self.config.cache_results {
            if let Some(value) = self.cache_lookup(&task) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                let duration_ms = started.elapsed().as_millis() as u64;
                self.history
                    .record(HistoryRecord::new(task.id.clone(), duration_ms, true));
                debug!(task_id = %task.id, "Task served from cache");
                return TaskFinished {
                    task_id: task.id,
                    objective_id: task.objective_id,
                    agent_id,
                    duration_ms,
                    result: Ok(value),
                    from_cache: true,
                };
            }
        }

        let payload = json!({
            "task_id": task.id,
            "task_type": task.task_type,
            "name": task.name,
            "description": task.description,
            "input": task.input,
            "agent_id": agent_id,
        });

        let outcome = tokio::time::timeout(
            self.config.task_timeout,
            self.pool
                .execute(move |conn| async move { conn.request(&payload).await }),
        )
        .await;

        let result = match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Self::classify(e)),
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(TaskErrorDetail::transient(format!(
                    "execution timed out after {:?}",
                    self.config.task_timeout
                )))
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let success = result.is_ok();

        if started.elapsed() > self.config.slow_task_threshold {
            warn!(task_id = %task.id, duration_ms, "Slow task execution");
        }

        match &result {
            Ok(value) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                if self.config.cache_results {
                    // 只缓存成功结果
                    if let Ok(bytes) = serde_json::to_vec(value) {
                        self.cache
                            .put(Self::cache_key(&task), bytes, self.config.result_ttl);
                    }
                }
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = %task.id, error = %e.message, retryable = e.retryable, "Task failed");
            }
        }

        self.history
            .record(HistoryRecord::new(task.id.clone(), duration_ms, success));
        self.persist(&task, &agent_id, duration_ms, &result).await;

        TaskFinished {
            task_id: task.id,
            objective_id: task.objective_id,
            agent_id,
            duration_ms,
            result,
            from_cache: false,
        }
    }

    /// 缓存查找，负载损坏按未命中处理并清掉坏条目
    fn cache_lookup(&self, task: &Task) -> Option<serde_json::Value> {
        let key = Self::cache_key(task);
        let bytes = self.cache.get(&key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Corrupt cached payload, treating as miss");
                self.cache.delete(&key);
                None
            }
        }
    }

    /// 池层错误映射为任务错误，暂时性故障标记可重试
    fn classify(err: PoolError) -> TaskErrorDetail {
        match err {
            PoolError::Remote(re) => {
                if re.is_transient() {
                    TaskErrorDetail::transient(re.to_string())
                } else {
                    TaskErrorDetail::terminal(re.to_string())
                }
            }
            PoolError::AcquireTimeout { .. } => TaskErrorDetail::transient(err.to_string()),
            PoolError::ConnectFailed(_) => TaskErrorDetail::transient(err.to_string()),
            PoolError::ShuttingDown => TaskErrorDetail::terminal(err.to_string()),
        }
    }

    /// 尽力持久化结果，失败只记日志不影响任务终态
    async fn persist(
        &self,
        task: &Task,
        agent_id: &AgentId,
        duration_ms: u64,
        result: &Result<serde_json::Value, TaskErrorDetail>,
    ) {
        let Some(dir) = &self.config.persist_dir else {
            return;
        };
        let summary = PersistedResult {
            task_id: &task.id,
            agent_id,
            success: result.is_ok(),
            duration_ms,
            result: result.as_ref().ok(),
            error: result.as_ref().err(),
        };
        let path = dir.join(format!("{}.json", task.id));
        let write = self.files.write_json(&path, &summary).await;
        if !write.success {
            warn!(task_id = %task.id, path = %path.display(), "Failed to persist task result");
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            executed: self.executed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, desc: &str) -> Task {
        Task::new(id, "obj-1", "test").with_description(desc)
    }

    #[test]
    fn test_cache_key_ignores_task_id() {
        let a = task("t1", "same work");
        let b = task("t2", "same work");
        assert_eq!(TaskRunner::cache_key(&a), TaskRunner::cache_key(&b));
    }

    #[test]
    fn test_cache_key_differs_by_content() {
        let a = task("t1", "work a");
        let b = task("t1", "work b");
        assert_ne!(TaskRunner::cache_key(&a), TaskRunner::cache_key(&b));
    }

    #[test]
    fn test_classify_transient_errors() {
        use crate::pool::RemoteError;

        let detail = TaskRunner::classify(PoolError::Remote(RemoteError::RateLimited));
        assert!(detail.recoverable);
        assert!(detail.retryable);

        let detail = TaskRunner::classify(PoolError::Remote(RemoteError::Rejected(
            "bad request".to_string(),
        )));
        assert!(!detail.recoverable);
        assert!(!detail.retryable);

        let detail = TaskRunner::classify(PoolError::ShuttingDown);
        assert!(!detail.retryable);
    }
}
