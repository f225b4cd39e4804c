//! # 远程连接池
//!
//! 管理一组到远程补全服务的可复用连接，支持并发获取。
//!
//! ## 核心职责
//! - `acquire`：空闲连接复用 -> 按需新建（不超过 `max`）-> FIFO 排队等待
//! - `release`：优先直接交接给等待最久的调用者，避免惊群重扫
//! - `execute`：作用域获取辅助，任何退出路径都保证归还
//! - 后台空闲淘汰与健康检查，池大小不低于 `min`
//! - `drain`：拒绝排队者、限时等待在途连接、强制回收
//!
//! ## 注意
//!
//! 内部状态用 parking_lot 互斥锁保护，临界区内不做任何 I/O；
//! 连接建立、健康探测、断开都在锁外进行。

mod connection;

pub use connection::{RemoteConnection, RemoteConnector, RemoteError};

pub(crate) use connection::PooledConnection;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 连接池错误
#[derive(Error, Debug)]
pub enum PoolError {
    /// 等待超时，池内连接长时间未释放
    #[error("Acquire timed out after {waited_ms}ms")]
    AcquireTimeout { waited_ms: u64 },

    /// 池正在关闭
    #[error("Connection pool is shutting down")]
    ShuttingDown,

    /// 无任何可用连接且新建失败
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// 远程调用失败（透传给执行层做分类）
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// 连接池配置
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// 最小连接数（淘汰与健康检查都不会低于此值）
    pub min_connections: usize,
    /// 最大连接数
    pub max_connections: usize,
    /// 获取连接的排队超时
    pub acquire_timeout: Duration,
    /// 空闲连接淘汰阈值
    pub idle_timeout: Duration,
    /// 空闲淘汰检查间隔
    pub evict_interval: Duration,
    /// 健康检查间隔
    pub health_check_interval: Duration,
    /// 借出前是否健康探测
    pub test_on_borrow: bool,
    /// drain 时等待在途连接归还的宽限期
    pub drain_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            evict_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            test_on_borrow: false,
            drain_grace: Duration::from_secs(10),
        }
    }
}

/// 池状态快照
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiters: usize,
    pub created_total: u64,
    pub destroyed_total: u64,
    pub acquire_timeouts: u64,
    pub requests: u64,
    pub errors: u64,
}

/// 排队等待的调用者
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<PooledConnection, PoolError>>,
}

/// 池内部状态（单锁保护，临界区内无 I/O）
struct PoolState {
    idle: VecDeque<PooledConnection>,
    waiters: VecDeque<Waiter>,
    /// 已存在的连接数（含在途与正在建立的预留位）
    total: usize,
    in_use: usize,
    closed: bool,
    next_conn_id: u64,
    next_waiter_id: u64,
    created_total: u64,
    destroyed_total: u64,
    acquire_timeouts: u64,
    requests: u64,
    errors: u64,
}

impl PoolState {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            total: 0,
            in_use: 0,
            closed: false,
            next_conn_id: 0,
            next_waiter_id: 0,
            created_total: 0,
            destroyed_total: 0,
            acquire_timeouts: 0,
            requests: 0,
            errors: 0,
        }
    }
}

/// 远程连接池
pub struct ConnectionPool {
    connector: Arc<dyn RemoteConnector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    evict_handle: Mutex<Option<JoinHandle<()>>>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// 创建连接池并预热到 `min_connections`
    ///
    /// 预热失败直接返回错误；后台淘汰/健康检查任务随即启动。
    pub async fn connect(
        connector: Arc<dyn RemoteConnector>,
        config: PoolConfig,
    ) -> Result<Arc<Self>, PoolError> {
        let pool = Arc::new(Self {
            connector,
            config: config.clone(),
            state: Mutex::new(PoolState::new()),
            evict_handle: Mutex::new(None),
            health_handle: Mutex::new(None),
        });

        for _ in 0..config.min_connections {
            let conn = pool
                .connector
                .connect()
                .await
                .map_err(|e| PoolError::ConnectFailed(e.to_string()))?;
            let mut state = pool.state.lock();
            let id = state.next_conn_id;
            state.next_conn_id += 1;
            state.total += 1;
            state.created_total += 1;
            state.idle.push_back(PooledConnection::new(id, conn));
        }

        pool.start_eviction_task();
        pool.start_health_check_task();

        info!(
            min = config.min_connections,
            max = config.max_connections,
            "Connection pool ready"
        );

        Ok(pool)
    }

    /// 获取一条连接
    ///
    /// 顺序：空闲复用（可选借出前探测）-> 未达 `max` 时新建 ->
    /// FIFO 排队等待，超过 `acquire_timeout` 返回超时错误。
    pub async fn acquire(self: &Arc<Self>) -> Result<PoolGuard, PoolError> {
        loop {
            enum Action {
                Reuse(PooledConnection),
                Create,
                Wait(oneshot::Receiver<Result<PooledConnection, PoolError>>, u64),
            }

            let action = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PoolError::ShuttingDown);
                }

                if let Some(pc) = state.idle.pop_front() {
                    state.in_use += 1;
                    Action::Reuse(pc)
                } else if state.total < self.config.max_connections {
                    // 预留一个名额，连接在锁外建立
                    state.total += 1;
                    Action::Create
                } else {
                    let (tx, rx) = oneshot::channel();
                    let id = state.next_waiter_id;
                    state.next_waiter_id += 1;
                    state.waiters.push_back(Waiter { id, tx });
                    Action::Wait(rx, id)
                }
            };

            match action {
                Action::Reuse(pc) => {
                    if self.config.test_on_borrow && !pc.conn.health_check().await {
                        debug!(conn_id = pc.id, "Borrow-time health check failed, discarding");
                        self.destroy_in_use(pc).await;
                        continue;
                    }
                    return Ok(PoolGuard::new(self.clone(), pc));
                }
                Action::Create => match self.connector.connect().await {
                    Ok(conn) => {
                        let mut state = self.state.lock();
                        let id = state.next_conn_id;
                        state.next_conn_id += 1;
                        state.created_total += 1;
                        state.in_use += 1;
                        drop(state);
                        debug!(conn_id = id, "Created new pooled connection");
                        return Ok(PoolGuard::new(self.clone(), PooledConnection::new(id, conn)));
                    }
                    Err(e) => {
                        // 新建失败：有存量连接时转入排队，等待别人释放；
                        // 池中一条连接都没有时才向上传播
                        let none_exist = {
                            let mut state = self.state.lock();
                            state.total -= 1;
                            state.total == 0
                        };
                        warn!(error = %e, "Connection creation failed during acquire");
                        if none_exist {
                            return Err(PoolError::ConnectFailed(e.to_string()));
                        }
                        match self.wait_for_release().await {
                            Ok(pc) => return Ok(PoolGuard::new(self.clone(), pc)),
                            Err(err) => return Err(err),
                        }
                    }
                },
                Action::Wait(rx, waiter_id) => {
                    return match self.await_waiter(rx, waiter_id).await {
                        Ok(pc) => Ok(PoolGuard::new(self.clone(), pc)),
                        Err(e) => Err(e),
                    };
                }
            }
        }
    }

    /// 非阻塞获取：只复用空闲连接，不新建也不排队
    pub fn try_acquire(self: &Arc<Self>) -> Result<Option<PoolGuard>, PoolError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PoolError::ShuttingDown);
        }
        match state.idle.pop_front() {
            Some(pc) => {
                state.in_use += 1;
                drop(state);
                Ok(Some(PoolGuard::new(self.clone(), pc)))
            }
            None => Ok(None),
        }
    }

    /// 作用域获取辅助
    ///
    /// 获取连接、执行 `f`、记录本次请求的耗时与结果，随后无论成败
    /// 都归还连接。
    pub async fn execute<T, F, Fut>(self: &Arc<Self>, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(Arc<dyn RemoteConnection>) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut guard = self.acquire().await?;
        let start = Instant::now();
        let result = f(guard.connection()).await;
        guard.record(start.elapsed(), result.is_err());
        // guard 在此析构，归还连接
        result.map_err(PoolError::from)
    }

    /// 池状态快照
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            in_use: state.in_use,
            waiters: state.waiters.len(),
            created_total: state.created_total,
            destroyed_total: state.destroyed_total,
            acquire_timeouts: state.acquire_timeouts,
            requests: state.requests,
            errors: state.errors,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// 关闭连接池
    ///
    /// 停止后台任务、以 [`PoolError::ShuttingDown`] 拒绝所有排队者、
    /// 限时等待在途连接归还，随后强制断开剩余连接。
    pub async fn drain(&self) {
        if let Some(handle) = self.evict_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.health_handle.lock().take() {
            handle.abort();
        }

        let rejected = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        let rejected_count = rejected.len();
        for waiter in rejected {
            let _ = waiter.tx.send(Err(PoolError::ShuttingDown));
        }

        // 宽限期内等待在途连接归还；归还路径看到 closed 后会直接销毁
        let deadline = Instant::now() + self.config.drain_grace;
        while self.state.lock().in_use > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let (leftover_idle, leaked) = {
            let mut state = self.state.lock();
            let idle = std::mem::take(&mut state.idle);
            state.destroyed_total += idle.len() as u64;
            state.total = state.in_use;
            (idle, state.in_use)
        };
        for pc in &leftover_idle {
            pc.conn.disconnect().await;
        }

        if leaked > 0 {
            warn!(leaked, "Pool drained with connections still in flight");
        }
        info!(rejected = rejected_count, "Connection pool drained");
    }

    /// 等待别的调用者释放连接（新建失败后的降级路径）
    async fn wait_for_release(self: &Arc<Self>) -> Result<PooledConnection, PoolError> {
        let (rx, waiter_id) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PoolError::ShuttingDown);
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            (rx, id)
        };
        self.await_waiter(rx, waiter_id).await
    }

    /// 带超时地等待交接
    async fn await_waiter(
        &self,
        mut rx: oneshot::Receiver<Result<PooledConnection, PoolError>>,
        waiter_id: u64,
    ) -> Result<PooledConnection, PoolError> {
        let waited = self.config.acquire_timeout;
        match tokio::time::timeout(waited, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::ShuttingDown),
            Err(_) => {
                {
                    let mut state = self.state.lock();
                    state.waiters.retain(|w| w.id != waiter_id);
                    state.acquire_timeouts += 1;
                }
                // 移除和交接可能竞争：超时瞬间可能已有连接送达
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(PoolError::AcquireTimeout {
                        waited_ms: waited.as_millis() as u64,
                    }),
                }
            }
        }
    }

    /// 归还连接
    ///
    /// 有排队者时直接交接给等待最久的（保持 in_use），否则转入空闲队列。
    fn release_inner(&self, mut pc: PooledConnection) {
        pc.last_used = Instant::now();
        pc.use_count += 1;

        let mut state = self.state.lock();
        if state.closed {
            state.in_use = state.in_use.saturating_sub(1);
            state.total = state.total.saturating_sub(1);
            state.destroyed_total += 1;
            drop(state);
            let conn = pc.conn.clone();
            // Drop 可能发生在 runtime 之外，拿不到句柄时跳过异步断开
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { conn.disconnect().await });
            }
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(Ok(pc)) {
                Ok(()) => return, // 连接保持 in_use，直接易主
                Err(Ok(returned)) => pc = returned, // 等待者已放弃（超时），尝试下一个
                Err(Err(_)) => unreachable!("release never sends errors"),
            }
        }

        state.in_use = state.in_use.saturating_sub(1);
        // 空闲队列按 LIFO 使用：刚释放的连接放到队首，下一次 acquire
        // 优先复用它（连接保持热度，队尾的自然老化后被淘汰）
        state.idle.push_front(pc);
    }

    /// 把一条不处于 in_use 状态的连接放回池中
    ///
    /// 与 [`ConnectionPool::release_inner`] 同样优先交接给排队者
    /// （交接后连接转为 in_use），没有排队者才进空闲队列。
    /// 健康检查把连接整体取出探测期间入队的等待者靠这条路径拿到连接，
    /// 而不是干等到超时。
    fn reinsert_idle(&self, mut pc: PooledConnection) {
        let mut state = self.state.lock();
        if state.closed {
            state.total = state.total.saturating_sub(1);
            state.destroyed_total += 1;
            drop(state);
            let conn = pc.conn.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { conn.disconnect().await });
            }
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.tx.send(Ok(pc)) {
                Ok(()) => {
                    state.in_use += 1;
                    return;
                }
                Err(Ok(returned)) => pc = returned,
                Err(Err(_)) => unreachable!("reinsert never sends errors"),
            }
        }
        state.idle.push_front(pc);
    }

    /// 销毁一条处于 in_use 状态的连接（借出探测失败等场景）
    async fn destroy_in_use(&self, pc: PooledConnection) {
        {
            let mut state = self.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
            state.total = state.total.saturating_sub(1);
            state.destroyed_total += 1;
        }
        pc.conn.disconnect().await;
    }

    /// 启动空闲淘汰任务
    ///
    /// 销毁空闲超过 `idle_timeout` 的连接，但池大小不低于 `min`。
    fn start_eviction_task(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let interval = self.config.evict_interval;
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                timer.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                pool.evict_idle_once();
            }
        });
        *self.evict_handle.lock() = Some(handle);
    }

    fn evict_idle_once(self: &Arc<Self>) {
        let now = Instant::now();
        let min = self.config.min_connections;
        let idle_timeout = self.config.idle_timeout;

        let evicted = {
            let mut state = self.state.lock();
            let mut keep = VecDeque::new();
            let mut evicted = Vec::new();
            while let Some(pc) = state.idle.pop_front() {
                let above_min = state.total - evicted.len() > min;
                if above_min && pc.idle_for(now) >= idle_timeout {
                    evicted.push(pc);
                } else {
                    keep.push_back(pc);
                }
            }
            state.idle = keep;
            state.total -= evicted.len();
            state.destroyed_total += evicted.len() as u64;
            evicted
        };

        if evicted.is_empty() {
            return;
        }
        tokio::spawn(async move {
            let now = Instant::now();
            for pc in evicted {
                debug!(
                    conn_id = pc.id,
                    age_secs = pc.age(now).as_secs(),
                    "Idle connection evicted"
                );
                pc.conn.disconnect().await;
            }
        });
    }

    /// 启动健康检查任务
    ///
    /// 探测空闲连接；不健康的销毁，池低于 `min` 时立即补充。
    fn start_health_check_task(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let interval = self.config.health_check_interval;
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                timer.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                pool.health_check_once().await;
            }
        });
        *self.health_handle.lock() = Some(handle);
    }

    async fn health_check_once(self: &Arc<Self>) {
        // 空闲连接整体取出，探测在锁外进行
        let candidates = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            std::mem::take(&mut state.idle)
        };

        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        for pc in candidates {
            if pc.conn.health_check().await {
                healthy.push(pc);
            } else {
                unhealthy.push(pc);
            }
        }

        let replacements = {
            let mut state = self.state.lock();
            state.total -= unhealthy.len();
            state.destroyed_total += unhealthy.len() as u64;
            let deficit = self.config.min_connections.saturating_sub(state.total);
            // 名额先预留，建连在锁外
            state.total += deficit;
            deficit
        };

        // 探测期间可能有调用者入队，健康连接按排队者优先放回
        for pc in healthy {
            self.reinsert_idle(pc);
        }

        if !unhealthy.is_empty() {
            warn!(count = unhealthy.len(), "Destroying unhealthy connections");
        }
        for pc in unhealthy {
            pc.conn.disconnect().await;
        }

        for _ in 0..replacements {
            match self.connector.connect().await {
                Ok(conn) => {
                    let pc = {
                        let mut state = self.state.lock();
                        let id = state.next_conn_id;
                        state.next_conn_id += 1;
                        state.created_total += 1;
                        PooledConnection::new(id, conn)
                    };
                    self.reinsert_idle(pc);
                }
                Err(e) => {
                    self.state.lock().total -= 1;
                    warn!(error = %e, "Failed to replace unhealthy connection");
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &stats)
            .finish()
    }
}

/// 连接守卫
///
/// 析构时自动归还连接；也可调用 [`PoolGuard::release`] 提前归还。
pub struct PoolGuard {
    pool: Arc<ConnectionPool>,
    pc: Option<PooledConnection>,
}

impl PoolGuard {
    fn new(pool: Arc<ConnectionPool>, pc: PooledConnection) -> Self {
        Self {
            pool,
            pc: Some(pc),
        }
    }

    /// 连接 ID（测试与诊断用）
    pub fn id(&self) -> u64 {
        self.pc.as_ref().map(|pc| pc.id).unwrap_or(u64::MAX)
    }

    /// 底层连接句柄
    pub fn connection(&self) -> Arc<dyn RemoteConnection> {
        self.pc
            .as_ref()
            .expect("guard accessed after release")
            .conn
            .clone()
    }

    /// 记录一次请求（`execute` 内部调用）
    pub(crate) fn record(&mut self, duration: Duration, is_error: bool) {
        if let Some(pc) = self.pc.as_mut() {
            pc.record_request(duration, is_error);
        }
        let mut state = self.pool.state.lock();
        state.requests += 1;
        if is_error {
            state.errors += 1;
        }
    }

    /// 提前归还
    pub fn release(mut self) {
        if let Some(pc) = self.pc.take() {
            self.pool.release_inner(pc);
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(pc) = self.pc.take() {
            self.pool.release_inner(pc);
        }
    }
}

impl std::fmt::Debug for PoolGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").field("conn_id", &self.id()).finish()
    }
}
