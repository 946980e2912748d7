//! # Scheduler Configuration
//!
//! Loaded once at startup, usually as the `[scheduler]` table of the host's
//! TOML config:
//!
//! ```toml
//! [scheduler]
//! reserved_cores = 1
//! pin_threads = true
//! idle_sleep_ms = 2
//!
//! [[scheduler.specialized_workers]]
//! capabilities = ["octree", "mesh"]
//! count = 2
//! priority = "high"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::capability::CapabilitySet;
use crate::error::ConfigError;

/// Scheduling hint recorded on a worker. The OS scheduler is not asked to
/// honour it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPriority {
    /// Housekeeping workers.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Latency-sensitive workers.
    High,
}

/// A group of identical specialized workers.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SpecializedWorkerConfig {
    /// Capability names, see [`CapabilitySet::from_name`].
    pub capabilities: Vec<String>,
    /// Number of workers in the group.
    #[serde(default = "default_group_size")]
    pub count: usize,
    /// Priority hint.
    #[serde(default)]
    pub priority: WorkerPriority,
}

const fn default_group_size() -> usize {
    1
}

impl SpecializedWorkerConfig {
    /// Parsed capability set.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` naming the first unknown capability.
    pub fn capability_set(&self) -> Result<CapabilitySet, ConfigError> {
        CapabilitySet::from_names(&self.capabilities)
            .map_err(|name| ConfigError::Invalid(format!("unknown capability '{name}'")))
    }
}

/// Scheduler and worker pool settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Generic workers. `None` sizes the pool from the core count.
    pub worker_count: Option<usize>,
    /// Cores kept free for the host (lowest core numbers).
    pub reserved_cores: usize,
    /// Spread workers across NUMA nodes.
    pub numa_aware: bool,
    /// Pin each worker to its node's cores.
    pub pin_threads: bool,
    /// Idle wait before a worker rescans the queues (ms).
    pub idle_sleep_ms: u64,
    /// Extra tasks a worker moves into its private queue per shared pop.
    pub local_batch: usize,
    /// Period of automatic cleanup (s). 0 disables it.
    pub cleanup_interval_secs: u64,
    /// Age after which terminal tasks are cleaned up (s).
    pub max_task_age_secs: u64,
    /// Specialized worker groups, spawned in addition to generic workers.
    pub specialized_workers: Vec<SpecializedWorkerConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            reserved_cores: 1, // Keep the main/render thread's core free
            numa_aware: true,
            pin_threads: false,
            idle_sleep_ms: 5,
            local_batch: 4,
            cleanup_interval_secs: 30,
            max_task_age_secs: 60,
            specialized_workers: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Small deterministic pool for tests and tools.
    #[must_use]
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count: Some(worker_count),
            reserved_cores: 0,
            numa_aware: false,
            idle_sleep_ms: 1,
            ..Self::default()
        }
    }

    /// Adds a specialized worker group.
    #[must_use]
    pub fn with_specialized(
        mut self,
        capabilities: &[&str],
        count: usize,
        priority: WorkerPriority,
    ) -> Self {
        self.specialized_workers.push(SpecializedWorkerConfig {
            capabilities: capabilities.iter().map(|c| (*c).to_string()).collect(),
            count,
            priority,
        });
        self
    }

    /// Parses a standalone scheduler TOML document.
    ///
    /// # Errors
    ///
    /// Returns `Parse` for malformed TOML and `Invalid` for bad values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a scheduler TOML file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == Some(0) && self.specialized_workers.is_empty() {
            return Err(ConfigError::Invalid(
                "scheduler needs at least one worker".to_string(),
            ));
        }
        if self.idle_sleep_ms == 0 {
            return Err(ConfigError::Invalid(
                "idle_sleep_ms must be at least 1".to_string(),
            ));
        }
        for group in &self.specialized_workers {
            if group.count == 0 {
                return Err(ConfigError::Invalid(
                    "specialized worker group with count 0".to_string(),
                ));
            }
            if group.capability_set()?.is_empty() {
                return Err(ConfigError::Invalid(
                    "specialized worker group without capabilities".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Generic worker count after applying the core-count default.
    #[must_use]
    pub fn resolved_worker_count(&self, available_cores: usize) -> usize {
        self.worker_count
            .unwrap_or_else(|| available_cores.saturating_sub(self.reserved_cores).max(1))
    }

    /// Idle wait as a duration.
    #[must_use]
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms.max(1))
    }

    /// Cleanup period, `None` when disabled.
    #[must_use]
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_secs > 0).then(|| Duration::from_secs(self.cleanup_interval_secs))
    }

    /// Terminal task retention.
    #[must_use]
    pub fn max_task_age(&self) -> Duration {
        Duration::from_secs(self.max_task_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = SchedulerConfig::from_toml_str("").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        assert_eq!(config.resolved_worker_count(8), 7);
        assert_eq!(config.resolved_worker_count(1), 1);
    }

    #[test]
    fn test_specialized_groups_parse() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            worker_count = 2
            pin_threads = true

            [[specialized_workers]]
            capabilities = ["octree", "mesh"]
            priority = "high"
            "#,
        )
        .unwrap();

        assert_eq!(config.resolved_worker_count(64), 2);
        let group = &config.specialized_workers[0];
        assert_eq!(group.count, 1);
        assert_eq!(group.priority, WorkerPriority::High);
        assert_eq!(
            group.capability_set().unwrap(),
            CapabilitySet::OCTREE | CapabilitySet::MESH
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let unknown = SchedulerConfig::default().with_specialized(&["warp_drive"], 1, WorkerPriority::Low);
        assert!(matches!(unknown.validate(), Err(ConfigError::Invalid(_))));

        let idle = SchedulerConfig {
            idle_sleep_ms: 0,
            ..SchedulerConfig::default()
        };
        assert!(idle.validate().is_err());

        let empty = SchedulerConfig {
            worker_count: Some(0),
            ..SchedulerConfig::default()
        };
        assert!(empty.validate().is_err());

        assert!(matches!(
            SchedulerConfig::from_toml_str("local_batch = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
