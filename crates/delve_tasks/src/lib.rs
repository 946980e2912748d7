//! # DELVE Tasks
//!
//! Task scheduler for the mining simulation: priorities, dependencies,
//! retries, cooperative cancellation, capability routing to specialized
//! workers, NUMA-aware placement and work stealing.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let scheduler = TaskScheduler::new(SchedulerConfig::default())?;
//!
//! let scan = scheduler.schedule_task(|_| scan_zone(7), TaskConfig::default(), "scan");
//! let mesh = scheduler.schedule_task(
//!     |ctx| rebuild_mesh(ctx),
//!     TaskConfig::default()
//!         .depends_on(scan)
//!         .with_capabilities(CapabilitySet::MESH),
//!     "mesh",
//! );
//! scheduler.wait_for_task(mesh, None);
//! ```
//!
//! ## Rules
//!
//! 1. **Bodies are `FnMut`** - retries call the same closure again
//! 2. **Cancellation is cooperative** - poll [`TaskContext::should_stop`]
//! 3. **Nothing escapes a worker** - errors and panics land in task status

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod capability;
pub mod config;
pub mod error;
pub mod numa;
pub mod scheduler;
pub mod task;
pub mod worker;

mod queue;

pub use capability::CapabilitySet;
pub use config::{SchedulerConfig, SpecializedWorkerConfig, WorkerPriority};
pub use error::{ConfigError, SchedulerError, TaskError, TaskResult};
pub use numa::{AffinityMask, NumaNode, NumaTopology, WorkerPlacement};
pub use scheduler::{SchedulerStats, TaskScheduler};
pub use task::{
    RetryStrategy, TaskConfig, TaskContext, TaskId, TaskOutcome, TaskPriority, TaskProgress,
    TaskSnapshot, TaskStatus,
};
pub use worker::{WorkerId, WorkerInfo};
