//! # Core Configuration
//!
//! One TOML document configures every subsystem:
//!
//! ```toml
//! [scheduler]
//! reserved_cores = 1
//! pin_threads = true
//!
//! [[scheduler.specialized_workers]]
//! capabilities = ["octree"]
//! count = 2
//!
//! [parallel]
//! min_parallel_items = 512
//! simd_lane_width = 16
//!
//! [zones]
//! zone_count = 4096
//! deadlock_warning_ms = 500
//! task_lock_timeout_ms = 2000
//! ```
//!
//! Every table and field is optional; missing values take their defaults.

use std::path::Path;
use std::time::Duration;

use delve_parallel::ParallelConfig;
use delve_tasks::SchedulerConfig;
use serde::Deserialize;

use crate::error::ConfigError;

/// Zone lock table settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ZoneConfig {
    /// Number of zones in the world partition.
    pub zone_count: usize,
    /// Untimed zone waits longer than this are logged as suspected
    /// deadlocks (ms).
    pub deadlock_warning_ms: u64,
    /// How long zone-bound tasks and loops wait for their zones (ms).
    pub task_lock_timeout_ms: u64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            zone_count: 1024,
            deadlock_warning_ms: 1_000,
            task_lock_timeout_ms: 5_000,
        }
    }
}

impl ZoneConfig {
    /// Deadlock warning threshold as a duration.
    #[must_use]
    pub fn deadlock_warning(&self) -> Duration {
        Duration::from_millis(self.deadlock_warning_ms)
    }

    /// Zone wait budget for tasks as a duration.
    #[must_use]
    pub fn task_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.task_lock_timeout_ms)
    }
}

/// Configuration for the whole concurrency core.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Task scheduler and worker pool.
    pub scheduler: SchedulerConfig,
    /// Parallel executor.
    pub parallel: ParallelConfig,
    /// Zone lock table.
    pub zones: ZoneConfig,
}

impl CoreConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `Parse` for malformed TOML and `Invalid` for bad values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Checks every section.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zones.zone_count == 0 {
            return Err(ConfigError::Invalid("zones: zone_count must be at least 1".into()));
        }
        if u32::try_from(self.zones.zone_count).is_err() {
            return Err(ConfigError::Invalid("zones: zone_count exceeds the zone id range".into()));
        }
        if self.zones.task_lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid("zones: task_lock_timeout_ms must be positive".into()));
        }
        self.scheduler.validate()?;
        self.parallel.validate()?;
        Ok(())
    }

    /// Small configuration for tests and tools: `workers` scheduler threads,
    /// `workers` parallel threads, 64 zones.
    #[must_use]
    pub fn for_testing(workers: usize) -> Self {
        Self {
            scheduler: SchedulerConfig::with_workers(workers),
            parallel: ParallelConfig::with_threads(workers),
            zones: ZoneConfig {
                zone_count: 64,
                deadlock_warning_ms: 1_000,
                task_lock_timeout_ms: 2_000,
            },
        }
    }
}
