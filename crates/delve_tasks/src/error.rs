//! # Task Error Types
//!
//! Errors surfaced through task status, completion callbacks and config
//! loading. A task error never escapes a worker thread: it is captured in
//! the task record and reported through [`TaskOutcome`](crate::TaskOutcome).

use std::time::Duration;

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Why a task did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task body reported failure.
    #[error("task failed: {0}")]
    Failed(String),

    /// The task body panicked; the panic was contained by the worker.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// A prerequisite ended failed or cancelled, so this task never ran.
    #[error("dependency {dependency} ended {status}")]
    DependencyFailed {
        /// The prerequisite that did not complete.
        dependency: TaskId,
        /// Its terminal status.
        status: TaskStatus,
    },

    /// A prerequisite id the scheduler has never issued.
    #[error("unknown dependency {0}")]
    UnknownDependency(TaskId),

    /// The body gave up because its deadline passed.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    /// The task was cancelled.
    #[error("task cancelled")]
    Cancelled,

    /// The scheduler shut down before the task could run.
    #[error("scheduler shut down")]
    SchedulerShutdown,
}

impl TaskError {
    /// Convenience constructor for body failures.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Whether another attempt could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Panicked(_) | Self::TimedOut(_))
    }
}

/// Result type returned by task bodies.
pub type TaskResult<T = ()> = Result<T, TaskError>;

/// Errors loading or validating scheduler configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The values parsed but make no sense together.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors starting the scheduler or adding workers.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The OS refused to create a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}
