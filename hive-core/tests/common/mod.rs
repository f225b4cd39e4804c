//! 集成测试公用的远端 mock

#![allow(dead_code)]

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use hive_core::pool::{RemoteConnection, RemoteConnector, RemoteError};

static TRACING: Once = Once::new();

/// 测试日志初始化：过滤级别由 RUST_LOG 控制，默认静默
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub type Responder =
    Arc<dyn Fn(&serde_json::Value) -> Result<serde_json::Value, RemoteError> + Send + Sync>;

/// 可编程的 mock 连接工厂
pub struct MockConnector {
    connects: AtomicU64,
    requests: Arc<AtomicU64>,
    request_delay: Duration,
    health_delay: Duration,
    /// 前 N 次健康探测返回不健康，之后恢复
    failing_health_checks: Arc<AtomicI64>,
    responder: Responder,
}

impl MockConnector {
    /// 默认回显：返回 {"echo": <payload>}
    pub fn new() -> Self {
        Self::with_responder(Arc::new(|payload| {
            Ok(serde_json::json!({ "echo": payload }))
        }))
    }

    pub fn with_responder(responder: Responder) -> Self {
        Self {
            connects: AtomicU64::new(0),
            requests: Arc::new(AtomicU64::new(0)),
            request_delay: Duration::ZERO,
            health_delay: Duration::ZERO,
            failing_health_checks: Arc::new(AtomicI64::new(0)),
            responder,
        }
    }

    /// 每次请求前固定延迟，模拟慢远端
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// 每次健康探测前固定延迟，拉长探测窗口
    pub fn with_health_delay(mut self, delay: Duration) -> Self {
        self.health_delay = delay;
        self
    }

    /// 前 n 次健康探测判定为不健康
    pub fn with_failing_health_checks(self, n: i64) -> Self {
        self.failing_health_checks.store(n, Ordering::SeqCst);
        self
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// 实际打到"远端"的请求数（缓存命中不计入）
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteConnection>, RemoteError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockConnection {
            requests: self.requests.clone(),
            request_delay: self.request_delay,
            health_delay: self.health_delay,
            failing_health_checks: self.failing_health_checks.clone(),
            responder: self.responder.clone(),
        }))
    }
}

struct MockConnection {
    requests: Arc<AtomicU64>,
    request_delay: Duration,
    health_delay: Duration,
    failing_health_checks: Arc<AtomicI64>,
    responder: Responder,
}

#[async_trait]
impl RemoteConnection for MockConnection {
    async fn request(&self, payload: &serde_json::Value) -> Result<serde_json::Value, RemoteError> {
        if !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
        self.requests.fetch_add(1, Ordering::SeqCst);
        (self.responder)(payload)
    }

    async fn health_check(&self) -> bool {
        if !self.health_delay.is_zero() {
            tokio::time::sleep(self.health_delay).await;
        }
        // 预算递减到零之前都判不健康
        self.failing_health_checks.fetch_sub(1, Ordering::SeqCst) <= 0
    }

    async fn disconnect(&self) {}
}
