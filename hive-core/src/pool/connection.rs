//! 远程连接抽象与池内连接簿记
//!
//! 池本身不关心远端协议，只依赖 [`RemoteConnector`] / [`RemoteConnection`]
//! 两个窄接口。生产实现通常封装一个推理服务客户端；测试用 mock。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

/// 远程调用错误
///
/// 执行层据此做 recoverable / retryable 分类。
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    /// 限流（HTTP 429 等价）
    #[error("Rate limited by remote service")]
    RateLimited,

    /// 调用超时
    #[error("Remote call timed out")]
    Timeout,

    /// 网络层故障
    #[error("Network error: {0}")]
    Network(String),

    /// 响应格式不合法
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// 远端明确拒绝（鉴权失败、请求非法等）
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// 连接建立失败
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
}

impl RemoteError {
    /// 瞬态故障：换个时间重试大概率成功
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::Network(_) | Self::ConnectFailed(_)
        )
    }
}

/// 连接工厂
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// 建立一条到远端补全服务的新连接
    async fn connect(&self) -> Result<Arc<dyn RemoteConnection>, RemoteError>;
}

/// 一条可复用的远端连接
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// 发起一次请求
    async fn request(&self, payload: &serde_json::Value)
        -> Result<serde_json::Value, RemoteError>;

    /// 轻量健康探测
    async fn health_check(&self) -> bool;

    /// 关闭连接（幂等）
    async fn disconnect(&self);
}

/// 池内连接及其簿记
///
/// 只由池持有；`in_use` 期间绝不会同时交给两个调用者。
pub(crate) struct PooledConnection {
    pub(crate) id: u64,
    pub(crate) conn: Arc<dyn RemoteConnection>,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) use_count: u64,
    pub(crate) requests: u64,
    pub(crate) errors: u64,
    /// 滚动平均响应时间（毫秒）
    pub(crate) avg_response_ms: f64,
}

impl PooledConnection {
    pub(crate) fn new(id: u64, conn: Arc<dyn RemoteConnection>) -> Self {
        let now = Instant::now();
        Self {
            id,
            conn,
            created_at: now,
            last_used: now,
            use_count: 0,
            requests: 0,
            errors: 0,
            avg_response_ms: 0.0,
        }
    }

    /// 记录一次请求的耗时与结果
    pub(crate) fn record_request(&mut self, duration: Duration, is_error: bool) {
        self.requests += 1;
        if is_error {
            self.errors += 1;
        }
        let ms = duration.as_secs_f64() * 1000.0;
        let n = self.requests as f64;
        self.avg_response_ms = (self.avg_response_ms * (n - 1.0) + ms) / n;
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    pub(crate) fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("use_count", &self.use_count)
            .field("requests", &self.requests)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}
