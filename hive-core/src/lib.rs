//! # Hive Core
//!
//! Concurrent task execution engine: a dependency-aware scheduler that
//! routes tasks to capability-matched agents, backed by a generic remote
//! connection pool, a TTL + LRU result cache, a bounded execution history
//! and a queued async file manager.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use hive_core::{EngineConfig, Orchestrator};
//! use hive_core::pool::RemoteConnector;
//!
//! async fn run(connector: Arc<dyn RemoteConnector>) -> hive_core::Result<()> {
//!     let engine = Orchestrator::start(EngineConfig::default(), connector).await?;
//!     let objective_id = engine.submit_objective("summarize the build logs").await?;
//!     println!("submitted {objective_id}");
//!     engine.shutdown().await
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fileops;
pub mod history;
pub mod pool;
pub mod scheduler;
pub mod types;

pub use cache::{CacheConfig, TtlCache};
pub use config::EngineConfig;
pub use error::{HiveError, Result};
pub use fileops::{AsyncFileManager, FileManagerConfig, FileOpResult};
pub use history::{ExecutionHistory, HistoryRecord, HistoryStats};
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolGuard, RemoteConnection, RemoteConnector, RemoteError};
pub use scheduler::{
    EngineEvent, ExecutorConfig, ObjectivePlanner, Orchestrator, SchedulerConfig, SingleTaskPlanner,
    TaskSpec,
};
pub use types::{Agent, AgentId, EngineStatus, ObjectiveId, Task, TaskId, TaskPriority, TaskStatus};
