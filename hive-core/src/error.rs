//! # Hive Error Types
//!
//! Centralized error handling for the Hive core library.

use thiserror::Error;

/// Result type alias for Hive operations
pub type Result<T> = std::result::Result<T, HiveError>;

/// Core error types for Hive
#[derive(Error, Debug)]
pub enum HiveError {
    /// Connection pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] crate::pool::PoolError),

    /// Scheduler-related errors
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// Task execution errors
    #[error("Execution error: {0}")]
    Execution(String),

    /// Objective decomposition errors
    #[error("Planning error: {0}")]
    Planning(String),

    /// Cyclic dependency detected during decomposition
    #[error("Cyclic dependency detected: {0:?}")]
    CycleDetected(Vec<String>),

    /// No registered agent can ever handle the task
    #[error("Task {task_id} is unroutable: missing capabilities {missing:?}")]
    Unroutable {
        task_id: String,
        missing: Vec<String>,
    },

    /// I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists errors
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Engine is shutting down and no longer accepts work
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Generic errors with context
    #[error("{0}")]
    Other(String),
}

impl HiveError {
    /// Create a new scheduler error
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::Scheduler(msg.into())
    }

    /// Create a new execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a new planning error
    pub fn planning(msg: impl Into<String>) -> Self {
        Self::Planning(msg.into())
    }

    /// Create a new not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new already exists error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new generic/other error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
