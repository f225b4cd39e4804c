//! TTL + LRU 缓存实现
//!
//! 基于 HashMap + 访问顺序队列：
//! - 容量超限时淘汰最久未访问的条目（按最后访问时间，非插入时间）
//! - `get` 惰性剔除已过期条目
//! - `touch` 只重置过期时间，不改变值
//! - 后台清扫任务可通过 `destroy` 停止

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::config::CacheConfig;

/// 过期回调：清扫任务剔除条目时调用
pub type ExpiryCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// 缓存统计指标
#[derive(Debug, Default)]
pub struct CacheMetrics {
    total_requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl CacheMetrics {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: u64) {
        self.expirations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// 命中率 (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.hits.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
        }
    }
}

/// 缓存统计快照
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheMetricsSnapshot {
    pub total_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
}

/// 缓存条目
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    inserted_at: Instant,
    expires_at: Instant,
    /// 最后访问时间（用于 LRU）
    last_accessed: Instant,
    access_count: u64,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            inserted_at: now,
            expires_at: now + ttl,
            last_accessed: now,
            access_count: 0,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn record_access(&mut self) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
    }
}

/// 缓存内部状态
#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// 访问顺序队列（最久未访问 -> 最近访问）
    access_order: VecDeque<String>,
}

impl CacheState {
    /// 移到队列尾部（最近访问）
    fn update_access_order(&mut self, key: &str) {
        self.access_order.retain(|k| k != key);
        self.access_order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key);
        if entry.is_some() {
            self.access_order.retain(|k| k != key);
        }
        entry
    }

    /// 淘汰最久未访问的条目
    fn pop_lru(&mut self) -> Option<String> {
        let key = self.access_order.pop_front()?;
        self.entries.remove(&key);
        Some(key)
    }

    /// 剔除所有已过期条目，返回被剔除的键
    fn remove_expired(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
        }
        if !expired.is_empty() {
            self.access_order.retain(|k| self.entries.contains_key(k));
        }

        expired
    }
}

/// TTL + LRU 缓存
pub struct TtlCache {
    config: CacheConfig,
    state: Arc<Mutex<CacheState>>,
    metrics: Arc<CacheMetrics>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TtlCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(CacheState::default())),
            metrics: Arc::new(CacheMetrics::default()),
            sweep_handle: Mutex::new(None),
        }
    }

    /// 写入缓存
    ///
    /// 容量超限且键为新增时，先淘汰最久未访问的条目。
    pub fn put(&self, key: impl Into<String>, value: Vec<u8>, ttl: Option<Duration>) {
        if !self.config.enabled {
            return;
        }

        let key = key.into();
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let mut state = self.state.lock();

        if state.entries.len() >= self.config.max_entries && !state.entries.contains_key(&key) {
            if let Some(evicted) = state.pop_lru() {
                tracing::debug!(key = %evicted, "Cache evicted");
                self.metrics.record_eviction();
            }
        }

        state.entries.insert(key.clone(), CacheEntry::new(value, ttl));
        state.update_access_order(&key);
    }

    /// 读取缓存
    ///
    /// 命中已过期的条目视为未命中，并当场剔除（惰性过期，
    /// 不依赖后台清扫）。
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        if !self.config.enabled {
            return None;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        self.metrics.record_request();

        let hit = match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.record_access();
                Some(entry.value.clone())
            }
            Some(_) => None,
            None => {
                self.metrics.record_miss();
                return None;
            }
        };

        match hit {
            Some(value) => {
                state.update_access_order(key);
                self.metrics.record_hit();
                Some(value)
            }
            None => {
                // 过期条目当场剔除，视为未命中
                state.remove(key);
                self.metrics.record_expirations(1);
                self.metrics.record_miss();
                None
            }
        }
    }

    /// 重置过期时间，不改变值
    ///
    /// 用于延长热点条目的生命周期。键不存在或已过期时返回 false。
    pub fn touch(&self, key: &str, new_ttl: Duration) -> bool {
        if !self.config.enabled {
            return false;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        let refreshed = match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = now + new_ttl;
                entry.record_access();
                Some(true)
            }
            Some(_) => Some(false),
            None => None,
        };

        match refreshed {
            Some(true) => {
                state.update_access_order(key);
                true
            }
            Some(false) => {
                state.remove(key);
                self.metrics.record_expirations(1);
                false
            }
            None => false,
        }
    }

    /// 删除指定条目
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false)
    }

    /// 剔除所有已过期条目，返回剔除数
    pub fn remove_expired_entries(&self) -> usize {
        let expired = self.state.lock().remove_expired(Instant::now());
        self.metrics.record_expirations(expired.len() as u64);
        expired.len()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.access_order.clear();
        self.metrics.reset();
    }

    pub fn size(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// 批量预热
    pub fn warm_up(&self, entries: Vec<(String, Vec<u8>)>) {
        for (key, value) in entries {
            self.put(key, value, None);
        }
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// 启动后台过期清扫任务
    ///
    /// 重复调用会替换旧任务。`on_expire` 对每个被剔除的键调用一次。
    pub fn start_sweep(&self, on_expire: Option<ExpiryCallback>) {
        let state = self.state.clone();
        let metrics = self.metrics.clone();
        let interval = self.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await; // 第一个 tick 立即返回，跳过
            loop {
                timer.tick().await;
                let expired = state.lock().remove_expired(Instant::now());
                if !expired.is_empty() {
                    metrics.record_expirations(expired.len() as u64);
                    tracing::debug!(count = expired.len(), "Swept expired cache entries");
                    if let Some(cb) = &on_expire {
                        for key in &expired {
                            cb(key);
                        }
                    }
                }
            }
        });

        if let Some(old) = self.sweep_handle.lock().replace(handle) {
            old.abort();
        }
    }

    /// 停止后台清扫任务
    pub fn destroy(&self) {
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for TtlCache {
    fn drop(&mut self) {
        self.destroy();
    }
}
