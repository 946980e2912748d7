//! # Task Scheduler
//!
//! Dependency-aware, priority-ordered scheduler over a fixed worker pool.
//!
//! ## Architecture
//!
//! ```text
//!   schedule_task ──► task map (Arc<TaskEntry>)
//!        │
//!        ├─ dependencies pending ──► parked in dependents map
//!        │                               │ last dependency completes
//!        ▼                               ▼
//!   ┌─────────────────┐   ┌──────────────────────┐
//!   │ capability queue│   │ shared queue         │  priority buckets
//!   └────────┬────────┘   └──────────┬───────────┘
//!            ▼                       ▼
//!     specialized workers      generic workers ◄──► private deques (steal)
//!                   │
//!                   ▼
//!       terminal transition: completion callback, waiters, dependents
//! ```
//!
//! ## Rules
//!
//! 1. **No scheduler lock is held while a body or callback runs**
//! 2. **Status is published before dependents are inspected** - a dependent
//!    registering concurrently either sees the terminal status or is found
//!    in the dependents map by the finishing task
//! 3. **Lock order**: dependents → task map → task state; completion lock →
//!    task map → task state. Nothing takes the dependents map while holding
//!    the task map.
//! 4. **Terminal transitions happen once** - they are guarded by the
//!    expected previous status
//! 5. **Delayed retries wait outside the ready queues** - they sit in a
//!    timer heap until due, so they never block ready work behind them
//! 6. **Failure cascades iterate** - dependents are resolved from a
//!    worklist, whatever the chain length

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_deque::Stealer;
use delve_sync::WaitFreeCounter;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::capability::CapabilitySet;
use crate::config::{SchedulerConfig, WorkerPriority};
use crate::error::{SchedulerError, TaskError, TaskResult};
use crate::numa::{NumaTopology, WorkerPlacement};
use crate::queue::{PriorityQueue, QueuedTask};
use crate::task::{
    CompletionCallback, TaskConfig, TaskContext, TaskEntry, TaskId, TaskOutcome, TaskProgress,
    TaskSnapshot, TaskStatus, TaskWork,
};
use crate::worker::{spawn_worker, WorkerContext, WorkerId, WorkerInfo, WorkerSlot, WorkerSpec};

/// Scheduler-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks ever submitted.
    pub submitted: u64,
    /// Tasks that completed.
    pub completed: u64,
    /// Tasks that ended failed.
    pub failed: u64,
    /// Tasks that ended cancelled.
    pub cancelled: u64,
    /// Retry attempts scheduled.
    pub retried: u64,
    /// Successful steals between workers.
    pub steals: u64,
    /// Terminal tasks removed by cleanup.
    pub cleaned_up: u64,
    /// Removed tasks whose final status is still remembered.
    pub retired: usize,
    /// Retries waiting for their delay to pass.
    pub delayed: usize,
    /// Tasks currently pending.
    pub pending: usize,
    /// Tasks currently running.
    pub running: usize,
    /// Live workers.
    pub workers: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub submitted: WaitFreeCounter,
    pub completed: WaitFreeCounter,
    pub failed: WaitFreeCounter,
    pub cancelled: WaitFreeCounter,
    pub retried: WaitFreeCounter,
    pub steals: WaitFreeCounter,
    pub cleaned_up: WaitFreeCounter,
}

#[inline]
fn count(counter: &WaitFreeCounter) -> u64 {
    u64::try_from(counter.get()).unwrap_or_default()
}

/// Final status of a task removed by cleanup.
#[derive(Clone, Copy, Debug)]
struct RetiredTask {
    status: TaskStatus,
    retired_at: Instant,
}

/// Whether a waiter may stop waiting on a task.
enum Settlement {
    Unknown,
    Open,
    Settled(TaskStatus),
}

/// State shared between the scheduler handle and its workers.
pub(crate) struct SchedulerShared {
    pub config: SchedulerConfig,
    topology: NumaTopology,
    next_task_id: WaitFreeCounter,
    next_worker_id: AtomicUsize,
    tasks: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
    retired: RwLock<HashMap<TaskId, RetiredTask>>,
    delayed: Mutex<BinaryHeap<Reverse<(Instant, TaskId)>>>,
    dependents: Mutex<HashMap<TaskId, Vec<TaskId>>>,
    pub shared_queue: Mutex<PriorityQueue>,
    pub capability_queue: Mutex<PriorityQueue>,
    workers: RwLock<Vec<Arc<WorkerSlot>>>,
    pub stealers: RwLock<Vec<(WorkerId, Stealer<TaskId>)>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    shutdown: AtomicBool,
    completion_lock: Mutex<()>,
    completion: Condvar,
    running: WaitFreeCounter,
    pub stats: StatCounters,
    last_cleanup: Mutex<Instant>,
}

impl SchedulerShared {
    fn new(config: SchedulerConfig, topology: NumaTopology, wake_capacity: usize) -> Self {
        let (wake_tx, wake_rx) = bounded(wake_capacity.max(1));
        Self {
            config,
            topology,
            next_task_id: WaitFreeCounter::default(),
            next_worker_id: AtomicUsize::new(0),
            tasks: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashMap::new()),
            delayed: Mutex::new(BinaryHeap::new()),
            dependents: Mutex::new(HashMap::new()),
            shared_queue: Mutex::new(PriorityQueue::new()),
            capability_queue: Mutex::new(PriorityQueue::new()),
            workers: RwLock::new(Vec::new()),
            stealers: RwLock::new(Vec::new()),
            wake_tx,
            wake_rx,
            shutdown: AtomicBool::new(false),
            completion_lock: Mutex::new(()),
            completion: Condvar::new(),
            running: WaitFreeCounter::default(),
            stats: StatCounters::default(),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Worker registry
    // =========================================================================

    pub fn allocate_worker_id(&self) -> WorkerId {
        WorkerId(self.next_worker_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register_worker(&self, slot: Arc<WorkerSlot>, stealer: Stealer<TaskId>) {
        let id = slot.id();
        self.workers.write().push(slot);
        self.stealers.write().push((id, stealer));
    }

    pub fn unregister_worker(&self, id: WorkerId) {
        self.workers.write().retain(|w| w.id() != id);
        self.stealers.write().retain(|(owner, _)| *owner != id);
    }

    fn has_specialist_for(&self, required: CapabilitySet) -> bool {
        self.workers
            .read()
            .iter()
            .any(|w| w.capabilities().is_some_and(|caps| caps.contains(required)))
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    fn entry(&self, id: TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks.read().get(&id).cloned()
    }

    /// Status of a live or retired task.
    fn status_of(&self, id: TaskId) -> Option<TaskStatus> {
        if let Some(entry) = self.entry(id) {
            return Some(entry.status());
        }
        // Cleanup inserts into `retired` before releasing the task map
        self.retired.read().get(&id).map(|retired| retired.status)
    }

    fn settlement(&self, id: TaskId) -> Settlement {
        if let Some(entry) = self.entry(id) {
            let state = entry.state.lock();
            return if state.settled {
                Settlement::Settled(state.status)
            } else {
                Settlement::Open
            };
        }
        self.retired
            .read()
            .get(&id)
            .map_or(Settlement::Unknown, |retired| Settlement::Settled(retired.status))
    }

    // =========================================================================
    // Submission and queueing
    // =========================================================================

    fn submit(
        &self,
        work: TaskWork,
        on_complete: Option<CompletionCallback>,
        config: TaskConfig,
        description: String,
    ) -> TaskId {
        let id = TaskId(u64::try_from(self.next_task_id.increment()).unwrap_or_default());
        let routed = config
            .capabilities
            .is_some_and(|caps| self.has_specialist_for(caps));
        let entry = Arc::new(TaskEntry::new(id, description, config, routed, work, on_complete));

        self.tasks.write().insert(id, Arc::clone(&entry));
        self.stats.submitted.increment();
        debug!(task = %id, description = %entry.description, priority = ?entry.config.priority, "task submitted");

        if self.is_shutdown() {
            self.finish(
                &entry,
                TaskStatus::Pending,
                TaskStatus::Cancelled,
                Some(TaskError::SchedulerShutdown),
            );
            return id;
        }

        match self.register_dependencies(&entry) {
            Ok(true) => self.enqueue(&entry),
            Ok(false) => debug!(task = %id, "task parked until dependencies complete"),
            Err(error) => {
                warn!(task = %id, %error, "task cannot run");
                self.finish(&entry, TaskStatus::Pending, TaskStatus::Failed, Some(error));
            }
        }
        id
    }

    /// Parks `entry` under each unfinished dependency.
    ///
    /// Returns `Ok(true)` when every dependency already completed.
    fn register_dependencies(&self, entry: &TaskEntry) -> Result<bool, TaskError> {
        if entry.config.dependencies.is_empty() {
            return Ok(true);
        }
        let mut dependents = self.dependents.lock();
        let mut waiting = false;
        for &dependency in &entry.config.dependencies {
            match self.status_of(dependency) {
                Some(TaskStatus::Completed) => {}
                Some(status @ (TaskStatus::Failed | TaskStatus::Cancelled)) => {
                    return Err(TaskError::DependencyFailed { dependency, status });
                }
                Some(TaskStatus::Pending | TaskStatus::Running) => {
                    dependents.entry(dependency).or_default().push(entry.id);
                    waiting = true;
                }
                None => return Err(TaskError::UnknownDependency(dependency)),
            }
        }
        Ok(!waiting)
    }

    /// `Ok(true)` when every dependency completed, `Ok(false)` while some
    /// are still open.
    fn dependencies_ready(&self, entry: &TaskEntry) -> Result<bool, TaskError> {
        let mut ready = true;
        for &dependency in &entry.config.dependencies {
            match self.status_of(dependency) {
                Some(TaskStatus::Completed) => {}
                Some(status @ (TaskStatus::Failed | TaskStatus::Cancelled)) => {
                    return Err(TaskError::DependencyFailed { dependency, status });
                }
                Some(TaskStatus::Pending | TaskStatus::Running) => ready = false,
                None => return Err(TaskError::UnknownDependency(dependency)),
            }
        }
        Ok(ready)
    }

    fn push_queued(&self, entry: &TaskEntry) {
        let queued = QueuedTask {
            id: entry.id,
            capabilities: entry.config.capabilities,
        };
        let queue = if entry.routed_to_specialists {
            &self.capability_queue
        } else {
            &self.shared_queue
        };
        queue.lock().push(entry.config.priority, queued);
    }

    /// Queues a ready task and wakes one idle worker.
    fn enqueue(&self, entry: &TaskEntry) {
        self.push_queued(entry);
        // Full channel means enough wakeups are already pending
        let _ = self.wake_tx.try_send(());
    }

    /// Puts a task back at the end of its bucket without waking anyone.
    fn requeue(&self, entry: &TaskEntry) {
        self.push_queued(entry);
    }

    pub fn requeue_id(&self, id: TaskId) {
        if let Some(entry) = self.entry(id) {
            if entry.status() == TaskStatus::Pending {
                self.requeue(&entry);
            }
        }
    }

    /// Holds a pending task back until `due`.
    fn defer(&self, id: TaskId, due: Instant) {
        self.delayed.lock().push(Reverse((due, id)));
    }

    /// Moves every retry whose delay has passed into the ready queues.
    pub fn promote_due_retries(&self) {
        let now = Instant::now();
        let due: Vec<TaskId> = {
            let mut delayed = self.delayed.lock();
            let mut due = Vec::new();
            while let Some(Reverse((at, id))) = delayed.peek().copied() {
                if at > now {
                    break;
                }
                delayed.pop();
                due.push(id);
            }
            due
        };
        for id in due {
            if let Some(entry) = self.entry(id) {
                if entry.status() == TaskStatus::Pending {
                    self.enqueue(&entry);
                }
            }
        }
    }

    /// Sleeps until woken, the idle period passes, or the next delayed
    /// retry falls due.
    pub fn idle_wait(&self) {
        let mut timeout = self.config.idle_sleep();
        if let Some(Reverse((due, _))) = self.delayed.lock().peek() {
            timeout = timeout.min(due.saturating_duration_since(Instant::now()));
        }
        let _ = self.wake_rx.recv_timeout(timeout);
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Moves a queued task to `Running` if it can run now on this worker.
    pub fn claim(&self, id: TaskId, ctx: &WorkerContext) -> Option<Arc<TaskEntry>> {
        let entry = self.entry(id)?;
        if !ctx.can_run(&entry) {
            self.enqueue(&entry);
            return None;
        }
        if entry.is_cancel_requested() {
            self.finish(
                &entry,
                TaskStatus::Pending,
                TaskStatus::Cancelled,
                Some(TaskError::Cancelled),
            );
            return None;
        }

        match self.dependencies_ready(&entry) {
            Ok(true) => {}
            Ok(false) => {
                self.requeue(&entry);
                return None;
            }
            Err(error) => {
                self.finish(&entry, TaskStatus::Pending, TaskStatus::Failed, Some(error));
                return None;
            }
        }

        let now = Instant::now();
        let mut state = entry.state.lock();
        if state.status != TaskStatus::Pending {
            return None;
        }
        if let Some(due) = state.retry_at.filter(|&at| at > now) {
            drop(state);
            self.defer(id, due);
            return None;
        }
        state.status = TaskStatus::Running;
        state.attempts += 1;
        state.started_at = Some(now);
        state.retry_at = None;
        let attempt = state.attempts;
        drop(state);

        debug!(task = %id, worker = %ctx.id(), attempt, "task started");
        Some(entry)
    }

    /// Runs one attempt of a claimed task and settles the result.
    pub fn execute(&self, entry: &Arc<TaskEntry>) {
        let (attempt, started_at) = {
            let state = entry.state.lock();
            (state.attempts, state.started_at.unwrap_or_else(Instant::now))
        };
        let deadline = entry.config.timeout.map(|limit| started_at + limit);

        self.running.increment();
        let work = entry.work.lock().take();
        let result = match work {
            Some(mut work) => {
                let ctx = TaskContext::new(Arc::clone(entry), attempt, deadline);
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&ctx)));
                *entry.work.lock() = Some(work);
                outcome.unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))))
            }
            None => Err(TaskError::failed("task body missing")),
        };
        self.running.decrement();

        let result = match (result, entry.config.timeout) {
            (Ok(()), Some(limit)) if started_at.elapsed() > limit => Err(TaskError::TimedOut(limit)),
            (result, _) => result,
        };
        self.settle(entry, attempt, result);
    }

    fn settle(&self, entry: &Arc<TaskEntry>, attempt: u32, result: TaskResult) {
        if entry.is_cancel_requested() {
            self.finish(
                entry,
                TaskStatus::Running,
                TaskStatus::Cancelled,
                Some(TaskError::Cancelled),
            );
            return;
        }

        match result {
            Ok(()) => {
                self.finish(entry, TaskStatus::Running, TaskStatus::Completed, None);
            }
            Err(TaskError::Cancelled) => {
                self.finish(
                    entry,
                    TaskStatus::Running,
                    TaskStatus::Cancelled,
                    Some(TaskError::Cancelled),
                );
            }
            Err(error) if error.is_retryable() && attempt <= entry.config.max_retries => {
                let delay = entry.config.retry.delay_for(attempt);
                let retry_at = (!delay.is_zero()).then(|| Instant::now() + delay);
                {
                    let mut state = entry.state.lock();
                    if state.status != TaskStatus::Running {
                        return;
                    }
                    state.status = TaskStatus::Pending;
                    state.retry_at = retry_at;
                    state.error = Some(error.clone());
                }
                self.stats.retried.increment();
                debug!(task = %entry.id, attempt, ?delay, %error, "task attempt failed, retrying");
                match retry_at {
                    Some(due) => self.defer(entry.id, due),
                    None => self.enqueue(entry),
                }
            }
            Err(error) => {
                warn!(task = %entry.id, attempt, %error, "task failed");
                self.finish(entry, TaskStatus::Running, TaskStatus::Failed, Some(error));
            }
        }
    }

    /// Terminal transition from `from` to `to`, then resolves dependents.
    ///
    /// Returns `false` if the task was not in `from`.
    fn finish(
        &self,
        entry: &Arc<TaskEntry>,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<TaskError>,
    ) -> bool {
        if !self.transition(entry, from, to, error) {
            return false;
        }
        self.release_dependents(entry.id, to);
        true
    }

    /// Publishes one terminal transition: status, completion callback and
    /// waiters. Dependents are left to the caller.
    fn transition(
        &self,
        entry: &Arc<TaskEntry>,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<TaskError>,
    ) -> bool {
        debug_assert!(to.is_terminal());
        let now = Instant::now();
        let outcome = {
            let mut state = entry.state.lock();
            if state.status != from {
                return false;
            }
            state.status = to;
            state.completed_at = Some(now);
            state.retry_at = None;
            state.error.clone_from(&error);
            TaskOutcome {
                id: entry.id,
                status: to,
                attempts: state.attempts,
                error,
                run_time: state.started_at.map(|at| now.duration_since(at)),
            }
        };

        // Release whatever the body captured
        drop(entry.work.lock().take());

        match to {
            TaskStatus::Completed => self.stats.completed.increment(),
            TaskStatus::Failed => self.stats.failed.increment(),
            _ => self.stats.cancelled.increment(),
        };
        debug!(task = %entry.id, status = %to, attempts = outcome.attempts, "task finished");

        let callback = entry.on_complete.lock().take();
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(&outcome))).is_err() {
                warn!(task = %entry.id, "completion callback panicked");
            }
        }

        entry.state.lock().settled = true;
        {
            let _guard = self.completion_lock.lock();
            self.completion.notify_all();
        }
        true
    }

    /// Enqueues dependents that became ready and fails those whose
    /// dependency did not complete, following failures down the graph.
    fn release_dependents(&self, id: TaskId, status: TaskStatus) {
        let mut finished = VecDeque::from([(id, status)]);
        while let Some((id, status)) = finished.pop_front() {
            let waiting = self.dependents.lock().remove(&id).unwrap_or_default();
            for dependent in waiting {
                let Some(entry) = self.entry(dependent) else {
                    continue;
                };
                let error = if status == TaskStatus::Completed {
                    match self.dependencies_ready(&entry) {
                        Ok(true) if entry.status() == TaskStatus::Pending => {
                            debug!(task = %dependent, "dependencies complete");
                            self.enqueue(&entry);
                            continue;
                        }
                        Ok(_) => continue,
                        Err(error) => error,
                    }
                } else {
                    debug!(task = %dependent, dependency = %id, %status, "dependency did not complete");
                    TaskError::DependencyFailed {
                        dependency: id,
                        status,
                    }
                };
                if self.transition(&entry, TaskStatus::Pending, TaskStatus::Failed, Some(error)) {
                    finished.push_back((dependent, TaskStatus::Failed));
                }
            }
        }
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Retires finished tasks older than `max_age` and forgets retired
    /// statuses that have been kept for `max_age` already.
    fn cleanup_finished(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut tasks = self.tasks.write();
        let mut retired = self.retired.write();
        retired.retain(|_, task| now.duration_since(task.retired_at) < max_age);
        let before = tasks.len();
        tasks.retain(|id, entry| {
            let state = entry.state.lock();
            let expired = state.settled
                && state
                    .completed_at
                    .is_some_and(|at| now.duration_since(at) >= max_age);
            if expired {
                retired.insert(
                    *id,
                    RetiredTask {
                        status: state.status,
                        retired_at: now,
                    },
                );
            }
            !expired
        });
        let removed = before - tasks.len();
        self.stats
            .cleaned_up
            .add(i64::try_from(removed).unwrap_or(i64::MAX));
        removed
    }

    pub fn run_periodic_cleanup(&self) {
        let Some(interval) = self.config.cleanup_interval() else {
            return;
        };
        let Some(mut last) = self.last_cleanup.try_lock() else {
            return;
        };
        if last.elapsed() < interval {
            return;
        }
        *last = Instant::now();
        drop(last);

        let removed = self.cleanup_finished(self.config.max_task_age());
        if removed > 0 {
            debug!(removed, "periodic task cleanup");
        }
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    fn wait_for(&self, id: TaskId, timeout: Option<Duration>) -> Option<TaskStatus> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.completion_lock.lock();
        loop {
            match self.settlement(id) {
                Settlement::Settled(status) => return Some(status),
                Settlement::Unknown => return None,
                Settlement::Open => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.completion.wait_until(&mut guard, deadline).timed_out() {
                        return match self.settlement(id) {
                            Settlement::Settled(status) => Some(status),
                            _ => None,
                        };
                    }
                }
                None => self.completion.wait(&mut guard),
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Dependency-aware task scheduler with a work-stealing worker pool.
///
/// Dropping the scheduler shuts it down.
pub struct TaskScheduler {
    shared: Arc<SchedulerShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Validates `config` and starts the worker pool.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid configuration and `Spawn` if a worker
    /// thread cannot be created (already started workers are stopped).
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;

        let topology = if config.numa_aware {
            NumaTopology::detect()
        } else {
            NumaTopology::single_node(num_cpus::get())
        };
        let generic = config.resolved_worker_count(topology.core_count());

        let mut specs = Vec::new();
        for _ in 0..generic {
            specs.push((None, WorkerPriority::Normal));
        }
        for group in &config.specialized_workers {
            let caps = group.capability_set()?;
            for _ in 0..group.count {
                specs.push((Some(caps), group.priority));
            }
        }

        let placements = topology.plan_placements(specs.len(), config.reserved_cores);
        let shared = Arc::new(SchedulerShared::new(config, topology, specs.len() * 2));
        let scheduler = Self {
            shared,
            handles: Mutex::new(Vec::with_capacity(specs.len())),
        };

        for ((capabilities, priority), placement) in specs.into_iter().zip(placements) {
            scheduler.spawn(capabilities, priority, placement)?;
        }

        info!(
            workers = scheduler.shared.workers.read().len(),
            numa_nodes = scheduler.shared.topology.node_count(),
            "task scheduler started"
        );
        Ok(scheduler)
    }

    fn spawn(
        &self,
        capabilities: Option<CapabilitySet>,
        priority: WorkerPriority,
        placement: WorkerPlacement,
    ) -> Result<WorkerId, SchedulerError> {
        let spec = WorkerSpec {
            capabilities,
            priority,
            numa_node: Some(placement.node),
            affinity: Some(placement.mask),
            pin: self.shared.config.pin_threads,
        };
        let (id, handle) = spawn_worker(&self.shared, spec).map_err(SchedulerError::Spawn)?;
        self.handles.lock().push(handle);
        Ok(id)
    }

    /// Adds a specialized worker at runtime.
    ///
    /// Tasks submitted afterwards with a tag inside `capabilities` are routed
    /// to the capability queue.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an empty capability set and `Spawn` if the
    /// thread cannot be created.
    pub fn spawn_specialized_worker(
        &self,
        capabilities: CapabilitySet,
        priority: WorkerPriority,
    ) -> Result<WorkerId, SchedulerError> {
        if capabilities.is_empty() {
            return Err(crate::error::ConfigError::Invalid(
                "specialized worker without capabilities".to_string(),
            )
            .into());
        }
        let index = self.shared.workers.read().len();
        let placement = self
            .shared
            .topology
            .plan_placements(index + 1, self.shared.config.reserved_cores)
            .pop()
            .unwrap_or_else(|| WorkerPlacement {
                worker_index: index,
                node: 0,
                mask: crate::numa::AffinityMask::new(),
            });
        self.spawn(Some(capabilities), priority, placement)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submits a task. Never blocks.
    pub fn schedule_task<F>(&self, work: F, config: TaskConfig, description: impl Into<String>) -> TaskId
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.shared
            .submit(Box::new(work), None, config, description.into())
    }

    /// Submits a task with a callback fired exactly once on its terminal
    /// transition.
    pub fn schedule_task_with_callback<F, C>(
        &self,
        work: F,
        on_complete: C,
        config: TaskConfig,
        description: impl Into<String>,
    ) -> TaskId
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
        C: FnOnce(&TaskOutcome) + Send + 'static,
    {
        self.shared.submit(
            Box::new(work),
            Some(Box::new(on_complete)),
            config,
            description.into(),
        )
    }

    /// Submits work on behalf of a registry type.
    pub fn schedule_type_task<F>(&self, type_id: u32, work: F, config: TaskConfig) -> TaskId
    where
        F: FnMut(&TaskContext) -> TaskResult + Send + 'static,
    {
        self.schedule_task(work, config, format!("type {type_id}"))
    }

    /// Installs a progress callback. Returns `false` for unknown or finished
    /// tasks.
    pub fn set_progress_callback<P>(&self, id: TaskId, callback: P) -> bool
    where
        P: Fn(&TaskProgress) + Send + Sync + 'static,
    {
        match self.shared.entry(id) {
            Some(entry) if !entry.status().is_terminal() => {
                entry.set_progress_callback(Arc::new(callback));
                true
            }
            _ => false,
        }
    }

    // =========================================================================
    // Control
    // =========================================================================

    /// Cancels a task.
    ///
    /// A pending task becomes `Cancelled` immediately. A running task is
    /// flagged and ends `Cancelled` once its body returns; with
    /// `wait_for_cancellation` this call blocks until then. Returns `false`
    /// for unknown or already finished tasks.
    pub fn cancel_task(&self, id: TaskId, wait_for_cancellation: bool) -> bool {
        let Some(entry) = self.shared.entry(id) else {
            return false;
        };
        if entry.status().is_terminal() {
            return false;
        }
        entry.cancel_requested.store(true, Ordering::Release);

        loop {
            if self.shared.finish(
                &entry,
                TaskStatus::Pending,
                TaskStatus::Cancelled,
                Some(TaskError::Cancelled),
            ) {
                debug!(task = %id, "pending task cancelled");
                return true;
            }
            match entry.status() {
                TaskStatus::Running => break,
                // Slipped back to pending for a retry
                TaskStatus::Pending => {}
                _ => return false,
            }
        }

        debug!(task = %id, "cancellation requested for running task");
        if wait_for_cancellation {
            self.shared.wait_for(id, None);
        }
        true
    }

    /// Blocks until the task is finished (and its completion callback has
    /// run) or `timeout` passes.
    ///
    /// Returns the terminal status, or `None` on timeout or unknown id.
    pub fn wait_for_task(&self, id: TaskId, timeout: Option<Duration>) -> Option<TaskStatus> {
        self.shared.wait_for(id, timeout)
    }

    /// Blocks until every task is finished. `timeout` bounds the whole call.
    ///
    /// Returns `false` on timeout or if any id is unknown.
    pub fn wait_for_tasks(&self, ids: &[TaskId], timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        ids.iter().all(|&id| {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            self.shared.wait_for(id, remaining).is_some()
        })
    }

    /// Removes finished tasks older than `max_age`. Returns how many.
    ///
    /// Their final status stays queryable through
    /// [`task_status`](Self::task_status) until a later cleanup finds it
    /// retired for `max_age` too.
    pub fn cleanup_finished_tasks(&self, max_age: Duration) -> usize {
        self.shared.cleanup_finished(max_age)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Status of a task, including cleaned-up ones.
    #[must_use]
    pub fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.shared.status_of(id)
    }

    /// Last reported progress of a live task.
    #[must_use]
    pub fn task_progress(&self, id: TaskId) -> Option<f32> {
        self.shared.entry(id).map(|entry| entry.progress())
    }

    /// Full view of a live task.
    #[must_use]
    pub fn task_snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.shared.entry(id).map(|entry| entry.snapshot())
    }

    /// Tasks waiting for dependencies, a retry delay or a worker.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared
            .tasks
            .read()
            .values()
            .filter(|entry| entry.status() == TaskStatus::Pending)
            .count()
    }

    /// Task bodies currently executing.
    #[must_use]
    pub fn running_count(&self) -> usize {
        usize::try_from(self.shared.running.get()).unwrap_or_default()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.shared.stats;
        SchedulerStats {
            submitted: count(&counters.submitted),
            completed: count(&counters.completed),
            failed: count(&counters.failed),
            cancelled: count(&counters.cancelled),
            retried: count(&counters.retried),
            steals: count(&counters.steals),
            cleaned_up: count(&counters.cleaned_up),
            retired: self.shared.retired.read().len(),
            delayed: self.shared.delayed.lock().len(),
            pending: self.pending_count(),
            running: self.running_count(),
            workers: self.shared.workers.read().len(),
        }
    }

    /// Descriptors of every worker.
    #[must_use]
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.shared.workers.read().iter().map(|w| w.info()).collect()
    }

    /// Workers whose supported set contains `required`.
    #[must_use]
    pub fn workers_for_capabilities(&self, required: CapabilitySet) -> Vec<WorkerId> {
        self.shared
            .workers
            .read()
            .iter()
            .filter(|w| w.capabilities().is_some_and(|caps| caps.contains(required)))
            .map(|w| w.id())
            .collect()
    }

    /// Topology the workers were placed on.
    #[must_use]
    pub fn topology(&self) -> &NumaTopology {
        &self.shared.topology
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stops and joins the workers, then cancels every task still pending.
    ///
    /// Running bodies finish their current attempt first. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("task scheduler shutting down");

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for _ in 0..handles.len() {
            let _ = self.shared.wake_tx.try_send(());
        }
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }

        self.shared.shared_queue.lock().drain();
        self.shared.capability_queue.lock().drain();
        self.shared.delayed.lock().clear();

        let live: Vec<_> = self.shared.tasks.read().values().cloned().collect();
        let mut cancelled = 0usize;
        for entry in live {
            entry.cancel_requested.store(true, Ordering::Release);
            if self.shared.finish(
                &entry,
                TaskStatus::Pending,
                TaskStatus::Cancelled,
                Some(TaskError::SchedulerShutdown),
            ) {
                cancelled += 1;
            }
        }
        info!(cancelled, "task scheduler stopped");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("stats", &self.stats())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
