//! Engine-wide configuration, aggregated per component and overridable
//! from a JSON file.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::cache::CacheConfig;
use crate::error::Result;
use crate::fileops::FileManagerConfig;
use crate::pool::PoolConfig;
use crate::scheduler::SchedulerConfig;

/// Top-level configuration. Defaults are usable as-is; a config file
/// only needs to name the fields it overrides.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub files: FileManagerConfig,
    pub scheduler: SchedulerConfig,
}

/// On-disk override shape. Durations are seconds, everything optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct EngineConfigFile {
    min_connections: Option<usize>,
    max_connections: Option<usize>,
    acquire_timeout_secs: Option<u64>,
    idle_timeout_secs: Option<u64>,
    cache_enabled: Option<bool>,
    cache_max_entries: Option<usize>,
    cache_default_ttl_secs: Option<u64>,
    write_concurrency: Option<usize>,
    read_concurrency: Option<usize>,
    max_concurrent_tasks: Option<usize>,
    task_timeout_secs: Option<u64>,
    history_capacity: Option<usize>,
}

impl EngineConfig {
    /// Load defaults overlaid with a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let file: EngineConfigFile = serde_json::from_str(&raw)?;
        let mut config = Self::default();
        config.apply(file);
        info!(path = %path.as_ref().display(), "Configuration loaded");
        Ok(config)
    }

    fn apply(&mut self, file: EngineConfigFile) {
        use std::time::Duration;

        if let Some(v) = file.min_connections {
            self.pool.min_connections = v;
        }
        if let Some(v) = file.max_connections {
            self.pool.max_connections = v;
        }
        if let Some(v) = file.acquire_timeout_secs {
            self.pool.acquire_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.idle_timeout_secs {
            self.pool.idle_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.cache_enabled {
            self.cache.enabled = v;
        }
        if let Some(v) = file.cache_max_entries {
            self.cache.max_entries = v;
        }
        if let Some(v) = file.cache_default_ttl_secs {
            self.cache.default_ttl = Duration::from_secs(v);
        }
        if let Some(v) = file.write_concurrency {
            self.files.write_concurrency = v;
        }
        if let Some(v) = file.read_concurrency {
            self.files.read_concurrency = v;
        }
        if let Some(v) = file.max_concurrent_tasks {
            self.scheduler.max_concurrent_tasks = v;
        }
        if let Some(v) = file.task_timeout_secs {
            self.scheduler.executor.task_timeout = Duration::from_secs(v);
        }
        if let Some(v) = file.history_capacity {
            self.scheduler.history_capacity = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let config = EngineConfig::default();
        assert!(config.pool.max_connections >= config.pool.min_connections);
        assert!(config.scheduler.max_concurrent_tasks > 0);
    }

    #[test]
    fn test_partial_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"max_connections": 32, "cache_enabled": false}"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.pool.max_connections, 32);
        assert!(!config.cache.enabled);
        // 未覆盖的字段保持默认
        assert_eq!(config.pool.min_connections, PoolConfig::default().min_connections);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(EngineConfig::from_file(&path).is_err());
    }
}
