//! 调度器端到端测试：依赖顺序、缓存命中、错误分类、级联失败与关闭

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockConnector;
use hive_core::pool::RemoteError;
use hive_core::scheduler::EngineEvent;
use hive_core::{Agent, EngineConfig, HiveError, Orchestrator, Task};
use tokio::sync::broadcast;

fn engine_config() -> EngineConfig {
    common::init_tracing();
    let mut config = EngineConfig::default();
    config.pool.min_connections = 1;
    config.pool.max_connections = 4;
    config.pool.evict_interval = Duration::from_secs(3600);
    config.pool.health_check_interval = Duration::from_secs(3600);
    config.scheduler.dispatch_interval = Duration::from_millis(10);
    config.scheduler.metrics_interval = Duration::from_secs(3600);
    config.scheduler.executor.task_timeout = Duration::from_secs(5);
    config
}

fn worker() -> Agent {
    Agent::new("agent-1", "worker").with_capabilities(["general"])
}

fn task(id: &str, objective: &str, desc: &str, deps: &[&str]) -> Task {
    Task::new(id, objective, id)
        .with_description(desc)
        .with_capabilities(vec!["general".to_string()])
        .with_dependencies(deps.iter().map(|d| d.to_string()).collect())
}

/// 收集事件直到指定 objective 结束
async fn wait_objective(
    rx: &mut broadcast::Receiver<EngineEvent>,
    objective_id: &str,
) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for objective")
            .expect("event channel closed");
        let done = matches!(
            &event,
            EngineEvent::ObjectiveCompleted { objective_id: oid, .. } if oid == objective_id
        );
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test]
async fn test_dependency_order() {
    let connector = Arc::new(MockConnector::new());
    let engine = Orchestrator::start(engine_config(), connector).await.unwrap();
    engine.register_agent(worker()).await.unwrap();

    let mut rx = engine.subscribe();
    let objective_id = engine
        .submit_tasks(
            "obj-order".to_string(),
            vec![
                task("a", "obj-order", "first step", &[]),
                task("b", "obj-order", "second step", &["a"]),
            ],
        )
        .await
        .unwrap();

    let events = wait_objective(&mut rx, &objective_id).await;

    let completed_a = events
        .iter()
        .position(|e| matches!(e, EngineEvent::TaskCompleted { task_id, .. } if task_id == "a"))
        .expect("a completed");
    let started_b = events
        .iter()
        .position(|e| matches!(e, EngineEvent::TaskStarted { task_id, .. } if task_id == "b"))
        .expect("b started");
    // b 在 a 完成之后才开始
    assert!(started_b > completed_a);

    assert!(matches!(
        events.last(),
        Some(EngineEvent::ObjectiveCompleted { success: true, .. })
    ));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cache_hit_skips_remote() {
    let connector = Arc::new(MockConnector::new());
    let engine = Orchestrator::start(engine_config(), connector.clone())
        .await
        .unwrap();
    engine.register_agent(worker()).await.unwrap();

    let mut rx = engine.subscribe();

    // 两个 objective，任务内容相同
    let first = engine
        .submit_tasks(
            "obj-one".to_string(),
            vec![task("one-t", "obj-one", "identical work", &[])],
        )
        .await
        .unwrap();
    wait_objective(&mut rx, &first).await;

    let second = engine
        .submit_tasks(
            "obj-two".to_string(),
            vec![task("two-t", "obj-two", "identical work", &[])],
        )
        .await
        .unwrap();
    let events = wait_objective(&mut rx, &second).await;

    // 第二次由缓存服务，远端只打了一次
    assert_eq!(connector.requests(), 1);
    assert_eq!(engine.executor_stats().cache_hits, 1);
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::TaskCompleted { from_cache: true, .. }
    )));

    // 两次执行的结果一致
    let first_result = engine
        .get_task("one-t".to_string())
        .await
        .unwrap()
        .unwrap()
        .result;
    let second_result = engine
        .get_task("two-t".to_string())
        .await
        .unwrap()
        .unwrap()
        .result;
    assert!(first_result.is_some());
    assert_eq!(first_result, second_result);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rate_limited_failure_is_retryable() {
    let connector = Arc::new(MockConnector::with_responder(Arc::new(|_| {
        Err(RemoteError::RateLimited)
    })));
    let engine = Orchestrator::start(engine_config(), connector).await.unwrap();
    engine.register_agent(worker()).await.unwrap();

    let mut rx = engine.subscribe();
    let objective_id = engine
        .submit_tasks(
            "obj-429".to_string(),
            vec![task("t", "obj-429", "rate limited work", &[])],
        )
        .await
        .unwrap();
    let events = wait_objective(&mut rx, &objective_id).await;

    let error = events
        .iter()
        .find_map(|e| match e {
            EngineEvent::TaskFailed { error, .. } => Some(error.clone()),
            _ => None,
        })
        .expect("task failed");
    assert!(error.recoverable);
    assert!(error.retryable);

    assert!(matches!(
        events.last(),
        Some(EngineEvent::ObjectiveCompleted { success: false, .. })
    ));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cycle_rejected() {
    let connector = Arc::new(MockConnector::new());
    let engine = Orchestrator::start(engine_config(), connector).await.unwrap();

    let err = engine
        .submit_tasks(
            "obj-cycle".to_string(),
            vec![
                task("a", "obj-cycle", "a", &["b"]),
                task("b", "obj-cycle", "b", &["a"]),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, HiveError::CycleDetected(_)));

    // 整个 objective 被拒绝，没有任务入队
    let status = engine.get_status().await.unwrap();
    assert_eq!(status.queued_tasks, 0);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unroutable_task_fails_terminally() {
    let connector = Arc::new(MockConnector::new());
    let engine = Orchestrator::start(engine_config(), connector).await.unwrap();
    engine.register_agent(worker()).await.unwrap();

    let mut rx = engine.subscribe();
    let objective_id = engine
        .submit_tasks(
            "obj-unroutable".to_string(),
            vec![Task::new("t", "obj-unroutable", "t")
                .with_capabilities(vec!["gpu-training".to_string()])],
        )
        .await
        .unwrap();
    let events = wait_objective(&mut rx, &objective_id).await;

    let error = events
        .iter()
        .find_map(|e| match e {
            EngineEvent::TaskFailed { error, .. } => Some(error.clone()),
            _ => None,
        })
        .expect("task failed");
    assert!(!error.recoverable);
    assert!(!error.retryable);

    let stored = engine.get_task("t".to_string()).await.unwrap().unwrap();
    assert_eq!(stored.status, hive_core::TaskStatus::Failed);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_upstream_failure_cascades() {
    let connector = Arc::new(MockConnector::with_responder(Arc::new(|_| {
        Err(RemoteError::Rejected("bad request".to_string()))
    })));
    let engine = Orchestrator::start(engine_config(), connector).await.unwrap();
    engine.register_agent(worker()).await.unwrap();

    let mut rx = engine.subscribe();
    let objective_id = engine
        .submit_tasks(
            "obj-cascade".to_string(),
            vec![
                task("a", "obj-cascade", "will fail", &[]),
                task("b", "obj-cascade", "never runs", &["a"]),
            ],
        )
        .await
        .unwrap();
    let events = wait_objective(&mut rx, &objective_id).await;

    let failed: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::TaskFailed { task_id, .. } => Some(task_id.clone()),
            _ => None,
        })
        .collect();
    assert!(failed.contains(&"a".to_string()));
    assert!(failed.contains(&"b".to_string()));

    let status = engine.get_status().await.unwrap();
    assert_eq!(status.failed_tasks, 2);
    assert_eq!(status.completed_tasks, 0);

    // 被连带失败的任务也要带上错误详情和完成时间
    let b = engine
        .get_task("b".to_string())
        .await
        .unwrap()
        .expect("task b should exist");
    assert_eq!(b.status, hive_core::types::TaskStatus::Failed);
    let err = b.error.expect("cascaded task should record an error");
    assert!(!err.retryable);
    assert!(err.message.contains("a"));
    assert!(b.completed_at.is_some());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_counts() {
    let connector = Arc::new(MockConnector::new());
    let engine = Orchestrator::start(engine_config(), connector).await.unwrap();
    engine.register_agent(worker()).await.unwrap();

    let mut rx = engine.subscribe();
    let objective_id = engine
        .submit_tasks(
            "obj-status".to_string(),
            vec![
                task("a", "obj-status", "step a", &[]),
                task("b", "obj-status", "step b", &["a"]),
            ],
        )
        .await
        .unwrap();
    wait_objective(&mut rx, &objective_id).await;

    let status = engine.get_status().await.unwrap();
    assert_eq!(status.completed_tasks, 2);
    assert_eq!(status.failed_tasks, 0);
    assert_eq!(status.active_tasks, 0);
    assert_eq!(status.total_agents, 1);
    assert_eq!(status.active_agents, 1);

    // 历史记录了每次执行
    assert_eq!(engine.history().get_all().len(), 2);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_results_persisted_to_disk() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = engine_config();
    config.scheduler.executor.persist_dir = Some(dir.path().to_path_buf());

    let connector = Arc::new(MockConnector::new());
    let engine = Orchestrator::start(config, connector).await.unwrap();
    engine.register_agent(worker()).await.unwrap();

    let mut rx = engine.subscribe();
    let objective_id = engine
        .submit_tasks(
            "obj-persist".to_string(),
            vec![task("t", "obj-persist", "persisted work", &[])],
        )
        .await
        .unwrap();
    wait_objective(&mut rx, &objective_id).await;
    engine.shutdown().await.unwrap();

    let raw = std::fs::read_to_string(dir.path().join("t.json")).unwrap();
    let summary: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(summary["task_id"], "t");
    assert_eq!(summary["success"], true);
}

#[tokio::test]
async fn test_planner_objective_roundtrip() {
    let connector = Arc::new(MockConnector::new());
    let engine = Orchestrator::start(engine_config(), connector).await.unwrap();
    // 默认规划器产出的任务不声明能力要求
    engine
        .register_agent(Agent::new("agent-1", "worker"))
        .await
        .unwrap();

    let mut rx = engine.subscribe();
    let objective_id = engine.submit_objective("summarize the logs").await.unwrap();
    let events = wait_objective(&mut rx, &objective_id).await;

    assert!(matches!(
        events.last(),
        Some(EngineEvent::ObjectiveCompleted { success: true, .. })
    ));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_rejects_new_submissions() {
    let connector = Arc::new(MockConnector::new());
    let engine = Orchestrator::start(engine_config(), connector).await.unwrap();
    engine.shutdown().await.unwrap();

    let err = engine.submit_objective("too late").await.unwrap_err();
    assert!(matches!(err, HiveError::ShuttingDown));
}
