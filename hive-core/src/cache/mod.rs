//! # 结果缓存模块
//!
//! TTL + LRU 的任务结果缓存。命中时执行层直接返回缓存值，
//! 完全绕过连接池。
//!
//! 过期判定使用单调时钟（`Instant`），避免系统时钟回拨导致的
//! 提前淘汰；清理既有惰性路径（`get` 时剔除），也有后台定期清扫。

mod config;
mod ttl;

pub use config::CacheConfig;
pub use ttl::{CacheMetrics, CacheMetricsSnapshot, ExpiryCallback, TtlCache};
