//! Errors for configuration loading and context construction.

use thiserror::Error;

/// Errors loading or validating [`CoreConfig`](crate::CoreConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The values parsed but are out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<delve_tasks::ConfigError> for ConfigError {
    fn from(err: delve_tasks::ConfigError) -> Self {
        match err {
            delve_tasks::ConfigError::Io(e) => Self::Io(e),
            delve_tasks::ConfigError::Parse(e) => Self::Parse(e),
            delve_tasks::ConfigError::Invalid(reason) => Self::Invalid(format!("scheduler: {reason}")),
        }
    }
}

impl From<delve_parallel::ParallelError> for ConfigError {
    fn from(err: delve_parallel::ParallelError) -> Self {
        match err {
            delve_parallel::ParallelError::InvalidConfig(reason) => {
                Self::Invalid(format!("parallel: {reason}"))
            }
        }
    }
}

/// Errors building a [`CoreContext`](crate::CoreContext).
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The task scheduler could not start.
    #[error("task scheduler failed to start: {0}")]
    Scheduler(#[from] delve_tasks::SchedulerError),

    /// A zone operation failed.
    #[error(transparent)]
    Sync(#[from] delve_sync::SyncError),
}

/// Result alias for context operations.
pub type CoreResult<T> = Result<T, CoreError>;
