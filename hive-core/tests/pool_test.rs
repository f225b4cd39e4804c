//! 连接池集成测试：容量边界、复用、排队与关闭

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockConnector;
use hive_core::pool::{ConnectionPool, PoolConfig, PoolError, RemoteError};

fn config(min: usize, max: usize) -> PoolConfig {
    common::init_tracing();
    PoolConfig {
        min_connections: min,
        max_connections: max,
        acquire_timeout: Duration::from_secs(5),
        // 后台任务在测试里保持安静
        evict_interval: Duration::from_secs(3600),
        health_check_interval: Duration::from_secs(3600),
        drain_grace: Duration::from_millis(200),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_warm_up_to_min() {
    let connector = Arc::new(MockConnector::new());
    let pool = ConnectionPool::connect(connector.clone(), config(2, 5))
        .await
        .unwrap();

    assert_eq!(connector.connects(), 2);
    let stats = pool.stats();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.idle, 2);
}

#[tokio::test]
async fn test_never_exceeds_max() {
    let connector = Arc::new(MockConnector::new());
    let pool = ConnectionPool::connect(connector.clone(), config(1, 3))
        .await
        .unwrap();

    let g1 = pool.acquire().await.unwrap();
    let g2 = pool.acquire().await.unwrap();
    let g3 = pool.acquire().await.unwrap();

    // 池满，非阻塞获取拿不到
    assert!(pool.try_acquire().unwrap().is_none());
    assert_eq!(pool.stats().total, 3);
    assert_eq!(pool.stats().in_use, 3);
    assert_eq!(connector.connects(), 3);

    drop(g1);
    drop(g2);
    drop(g3);
    assert_eq!(pool.stats().in_use, 0);
}

#[tokio::test]
async fn test_release_then_reuse_same_connection() {
    let connector = Arc::new(MockConnector::new());
    let pool = ConnectionPool::connect(connector.clone(), config(1, 1))
        .await
        .unwrap();

    let first = pool.acquire().await.unwrap();
    let first_id = first.id();
    drop(first);

    let second = pool.acquire().await.unwrap();
    assert_eq!(second.id(), first_id);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_reuse_prefers_most_recently_released() {
    let connector = Arc::new(MockConnector::new());
    let pool = ConnectionPool::connect(connector.clone(), config(2, 5))
        .await
        .unwrap();

    // 预热了两条空闲连接，刚放回的那条要排在复用首位
    let guard = pool.acquire().await.unwrap();
    let released_id = guard.id();
    drop(guard);

    let next = pool.acquire().await.unwrap();
    assert_eq!(next.id(), released_id);
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_sixth_caller_reuses_released() {
    let connector = Arc::new(MockConnector::new());
    let pool = ConnectionPool::connect(connector.clone(), config(2, 5))
        .await
        .unwrap();

    let mut guards = Vec::new();
    for _ in 0..5 {
        guards.push(pool.acquire().await.unwrap());
    }
    assert_eq!(connector.connects(), 5);

    let pool2 = pool.clone();
    let sixth = tokio::spawn(async move { pool2.acquire().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let released_id = guards[0].id();
    guards.remove(0);

    let guard = sixth.await.unwrap().unwrap();
    // 第六个调用者复用归还的连接，而不是新建第六条
    assert_eq!(guard.id(), released_id);
    assert_eq!(connector.connects(), 5);
}

#[tokio::test]
async fn test_acquire_timeout() {
    let connector = Arc::new(MockConnector::new());
    let mut cfg = config(1, 1);
    cfg.acquire_timeout = Duration::from_millis(100);
    let pool = ConnectionPool::connect(connector, cfg).await.unwrap();

    let _held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, PoolError::AcquireTimeout { .. }));
    assert_eq!(pool.stats().acquire_timeouts, 1);
}

#[tokio::test]
async fn test_waiters_served_fifo() {
    let connector = Arc::new(MockConnector::new());
    let pool = ConnectionPool::connect(connector, config(1, 1)).await.unwrap();

    let held = pool.acquire().await.unwrap();

    let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

    let pool_a = pool.clone();
    let tx_a = order_tx.clone();
    let a = tokio::spawn(async move {
        let guard = pool_a.acquire().await.unwrap();
        tx_a.send("a").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(guard);
    });
    // 确保 a 先入队
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pool_b = pool.clone();
    let b = tokio::spawn(async move {
        let guard = pool_b.acquire().await.unwrap();
        order_tx.send("b").unwrap();
        drop(guard);
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    drop(held);
    a.await.unwrap();
    b.await.unwrap();

    assert_eq!(order_rx.recv().await, Some("a"));
    assert_eq!(order_rx.recv().await, Some("b"));
}

#[tokio::test]
async fn test_health_sweep_hands_replacement_to_waiter() {
    // 首次探测判定不健康且耗时 200ms，调用者在探测窗口内入队，
    // 替补连接建好后必须直接交给排队者而不是等到获取超时
    let connector = Arc::new(
        MockConnector::new()
            .with_failing_health_checks(1)
            .with_health_delay(Duration::from_millis(200)),
    );
    let mut cfg = config(1, 1);
    cfg.health_check_interval = Duration::from_millis(50);
    cfg.acquire_timeout = Duration::from_millis(1000);
    let pool = ConnectionPool::connect(connector.clone(), cfg)
        .await
        .unwrap();

    // 等探测把唯一一条连接取走
    tokio::time::sleep(Duration::from_millis(150)).await;

    let start = std::time::Instant::now();
    let guard = pool.acquire().await.unwrap();
    assert!(
        start.elapsed() < Duration::from_millis(500),
        "waiter should get the replacement, not wait out the timeout"
    );
    // 不健康的连接被替换掉了
    assert_eq!(connector.connects(), 2);
    drop(guard);
}

#[tokio::test]
async fn test_execute_maps_remote_errors() {
    let connector = Arc::new(MockConnector::with_responder(Arc::new(|_| {
        Err(RemoteError::RateLimited)
    })));
    let pool = ConnectionPool::connect(connector, config(1, 2)).await.unwrap();

    let outcome = pool
        .execute(|conn| async move { conn.request(&serde_json::json!({})).await })
        .await;
    assert!(matches!(
        outcome,
        Err(PoolError::Remote(RemoteError::RateLimited))
    ));
    assert_eq!(pool.stats().errors, 1);
}

#[tokio::test]
async fn test_drain_rejects_waiters_and_new_acquires() {
    let connector = Arc::new(MockConnector::new());
    let pool = ConnectionPool::connect(connector, config(1, 1)).await.unwrap();

    let held = pool.acquire().await.unwrap();

    let pool_w = pool.clone();
    let waiter = tokio::spawn(async move { pool_w.acquire().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pool_d = pool.clone();
    let drain = tokio::spawn(async move { pool_d.drain().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 排队者被拒绝
    let outcome = waiter.await.unwrap();
    assert!(matches!(outcome, Err(PoolError::ShuttingDown)));

    drop(held);
    drain.await.unwrap();

    let outcome = pool.acquire().await;
    assert!(matches!(outcome, Err(PoolError::ShuttingDown)));
}
