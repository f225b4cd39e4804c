//! 缓存配置

use std::time::Duration;

/// TTL 缓存配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// 是否启用缓存
    pub enabled: bool,
    /// 最大条目数，超出后按 LRU 淘汰
    pub max_entries: usize,
    /// 默认 TTL
    pub default_ttl: Duration,
    /// 后台过期清理间隔
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
