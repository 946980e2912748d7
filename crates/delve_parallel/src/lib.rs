//! # DELVE Parallel
//!
//! Fork-join data parallelism for simulation passes: per-voxel field
//! updates, per-zone maintenance, SIMD batches.
//!
//! ```rust,ignore
//! let exec = ParallelExecutor::new(ParallelConfig::default())?;
//! let report = exec.parallel_for(field.len(), |i| relax(&field, i), ExecutionMode::Automatic, None);
//! assert!(report.is_complete());
//! ```
//!
//! ## Rules
//!
//! 1. **The caller blocks until the fan-out completes** - scoped threads only
//! 2. **Item closures are `Fn + Sync`** - shared state needs its own sync
//! 3. **A cancelled run reports what it skipped** - check
//!    [`ParallelReport::is_complete`]

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod error;
pub mod executor;
pub mod partition;

pub use config::ParallelConfig;
pub use error::{ParallelError, ParallelResult};
pub use executor::{ParallelExecutor, ParallelReport, ParallelStats};
pub use partition::{ExecutionMode, Plan};
