//! # DELVE Core
//!
//! Concurrency core for the mining simulation: one config document and one
//! context object that ties the lower crates together.
//!
//! | Crate | Provides |
//! |-------|----------|
//! | [`sync`] | spin, hybrid and reader-writer locks, lock hierarchy, zone locks, wait-free counters |
//! | [`tasks`] | dependency-aware task scheduler with NUMA placement and work stealing |
//! | [`parallel`] | chunked parallel-for executor |
//!
//! ## Rules
//!
//! 1. **Build one [`CoreContext`] per world** - no process-wide singletons
//! 2. **Zone-bound work goes through the context** - zone order stays enforced
//! 3. **Configuration is validated once** - at [`CoreContext::new`]

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod config;
pub mod context;
pub mod error;

pub use config::{CoreConfig, ZoneConfig};
pub use context::{CoreContext, ZoneLoopReport};
pub use error::{ConfigError, CoreError, CoreResult};

pub use delve_parallel as parallel;
pub use delve_sync as sync;
pub use delve_tasks as tasks;
