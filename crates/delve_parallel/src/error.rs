//! Parallel executor errors.

use thiserror::Error;

/// Errors constructing a [`ParallelExecutor`](crate::ParallelExecutor).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParallelError {
    /// A configuration value is out of range.
    #[error("invalid parallel configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias for this crate.
pub type ParallelResult<T> = Result<T, ParallelError>;
