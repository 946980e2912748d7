//! # Core Context
//!
//! The one object a host builds at startup and hands to every system that
//! needs zones, background tasks or data-parallel loops.
//!
//! ```text
//!                   CoreConfig (TOML)
//!                          │
//!                  CoreContext::new
//!          ┌───────────────┼────────────────┐
//!          ▼               ▼                ▼
//!   ZoneLockManager   TaskScheduler   ParallelExecutor
//!          ▲               │                │
//!          └── zone-bound tasks ── locked zone loops
//! ```
//!
//! There are no globals: share the context with `Arc<CoreContext>`.

use std::sync::Arc;

use delve_parallel::{ExecutionMode, ParallelExecutor, ParallelReport};
use delve_sync::{MultiZoneGuard, ZoneId, ZoneLockManager};
use delve_tasks::{TaskConfig, TaskContext, TaskError, TaskId, TaskResult, TaskScheduler};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};

/// Outcome of [`CoreContext::for_each_zone_locked`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZoneLoopReport {
    /// The underlying parallel run. Skipped zones count as processed here.
    pub run: ParallelReport,
    /// Zones whose lock was not acquired in time, ascending.
    pub skipped: Vec<ZoneId>,
}

impl ZoneLoopReport {
    /// Whether every zone was locked and visited.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.run.is_complete() && self.skipped.is_empty()
    }

    /// Zones whose callback actually ran.
    #[must_use]
    pub fn visited(&self) -> usize {
        self.run.processed_items.saturating_sub(self.skipped.len())
    }
}

/// Owner of the zone table, scheduler and parallel executor.
pub struct CoreContext {
    config: CoreConfig,
    zones: Arc<ZoneLockManager>,
    scheduler: TaskScheduler,
    parallel: ParallelExecutor,
}

impl CoreContext {
    /// Validates `config` and starts every subsystem.
    ///
    /// # Errors
    ///
    /// Returns `Config` for invalid settings and `Scheduler` when the worker
    /// pool cannot start.
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        config.validate()?;

        let zones = Arc::new(
            ZoneLockManager::new(config.zones.zone_count)
                .with_slow_acquire_warning(config.zones.deadlock_warning()),
        );
        let scheduler = TaskScheduler::new(config.scheduler.clone())?;
        let parallel = ParallelExecutor::new(config.parallel.clone()).map_err(crate::ConfigError::from)?;

        info!(
            zones = config.zones.zone_count,
            workers = scheduler.workers().len(),
            parallel_threads = parallel.thread_count(),
            "concurrency core ready"
        );

        Ok(Self {
            config,
            zones,
            scheduler,
            parallel,
        })
    }

    /// Configuration the context was built from.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Zone lock table.
    #[must_use]
    pub fn zones(&self) -> &Arc<ZoneLockManager> {
        &self.zones
    }

    /// Task scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Parallel executor.
    #[must_use]
    pub fn parallel(&self) -> &ParallelExecutor {
        &self.parallel
    }

    /// Locks `zones` for the calling thread with the configured budget.
    ///
    /// # Errors
    ///
    /// Returns `Sync` when a zone is out of range, already held by the
    /// caller, or not acquired in time.
    pub fn lock_zones(&self, zones: &[ZoneId]) -> CoreResult<MultiZoneGuard<'_>> {
        self.zones
            .multi_zone_guard(zones, Some(self.config.zones.task_lock_timeout()))
            .map_err(CoreError::from)
    }

    /// Submits a task that owns `zones` for the duration of each attempt.
    ///
    /// The zones are acquired on the worker thread before `work` runs and
    /// released when the attempt returns. Failing to get them within the
    /// configured budget fails the attempt, which the task's retry policy
    /// may then repeat.
    pub fn schedule_zone_task<F>(
        &self,
        zones: &[ZoneId],
        mut work: F,
        config: TaskConfig,
        description: impl Into<String>,
    ) -> TaskId
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
    {
        let manager = Arc::clone(&self.zones);
        let zones = zones.to_vec();
        let timeout = self.config.zones.task_lock_timeout();

        self.scheduler.schedule_task(
            move |ctx: &TaskContext| {
                let _held = manager
                    .multi_zone_guard(&zones, Some(timeout))
                    .map_err(|err| TaskError::failed(err.to_string()))?;
                work(ctx)
            },
            config,
            description,
        )
    }

    /// Runs `zone_fn` once per distinct zone, each call holding its zone.
    ///
    /// Zones that cannot be locked within the budget are skipped, logged
    /// and listed in [`ZoneLoopReport::skipped`]. `zone_fn` may start
    /// further loops on [`parallel`](Self::parallel); they run inline.
    pub fn for_each_zone_locked<F>(&self, zone_ids: &[ZoneId], zone_fn: F, mode: ExecutionMode) -> ZoneLoopReport
    where
        F: Fn(ZoneId) + Sync,
    {
        let timeout = self.config.zones.task_lock_timeout();
        let skipped = Mutex::new(Vec::new());
        let run = self.parallel.parallel_for_zones(
            zone_ids,
            |zone| match self.zones.zone_guard(zone, Some(timeout)) {
                Ok(_guard) => zone_fn(zone),
                Err(err) => {
                    warn!(zone, error = %err, "zone skipped");
                    skipped.lock().push(zone);
                }
            },
            mode,
        );

        let mut skipped = skipped.into_inner();
        skipped.sort_unstable();
        ZoneLoopReport { run, skipped }
    }

    /// Cancels the running parallel loop and stops the scheduler.
    ///
    /// Pending tasks finish as cancelled. Safe to call more than once.
    pub fn shutdown(&self) {
        self.parallel.cancel();
        self.scheduler.shutdown();
    }
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("zones", &self.zones)
            .field("scheduler", &self.scheduler)
            .field("parallel", &self.parallel.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use delve_tasks::TaskStatus;

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = CoreConfig::for_testing(1);
        config.zones.zone_count = 0;
        assert!(matches!(
            CoreContext::new(config),
            Err(CoreError::Config(crate::ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn test_lock_zones_releases_on_drop() {
        let core = CoreContext::new(CoreConfig::for_testing(1)).unwrap();
        {
            let guard = core.lock_zones(&[5, 1, 5]).unwrap();
            assert_eq!(guard.zones(), &[1, 5]);
            assert!(core.zones().is_owned_by_current_thread(1));
        }
        assert!(!core.zones().is_zone_locked(1));
        assert!(!core.zones().is_zone_locked(5));

        assert!(matches!(core.lock_zones(&[64]), Err(CoreError::Sync(_))));
        core.shutdown();
    }

    #[test]
    fn test_zone_task_holds_zones_while_running() {
        let core = CoreContext::new(CoreConfig::for_testing(2)).unwrap();
        let zones = Arc::clone(core.zones());
        let id = core.schedule_zone_task(
            &[7, 3],
            move |_ctx: &TaskContext| {
                assert!(zones.is_owned_by_current_thread(3));
                assert!(zones.is_owned_by_current_thread(7));
                Ok(())
            },
            TaskConfig::default(),
            "zone check",
        );
        assert_eq!(
            core.scheduler().wait_for_task(id, Some(Duration::from_secs(5))),
            Some(TaskStatus::Completed)
        );
        assert!(!core.zones().is_zone_locked(3));
        core.shutdown();
    }

    #[test]
    fn test_zone_loop_report_accounts_for_skips() {
        let core = CoreContext::new(CoreConfig::for_testing(1)).unwrap();
        let mut report = core.for_each_zone_locked(&[4, 8], |_| {}, ExecutionMode::ForceSequential);
        assert!(report.is_complete());
        assert_eq!(report.visited(), 2);

        report.skipped.push(8);
        assert!(!report.is_complete());
        assert_eq!(report.visited(), 1);
        core.shutdown();
    }
}
