//! # Worker Threads
//!
//! Each worker owns a private `crossbeam_deque` queue and a selection
//! strategy. Specialization is composition: a worker with a
//! [`CapabilitySet`] uses the specialized selector, one without uses the
//! generic selector. Both share the same loop:
//!
//! ```text
//!   ┌──► due retries: timer heap ──► ready queues
//!   │
//!   ├────────────► private queue ──┐
//!   │                              ▼
//!   │   selector: capability queue (specialized only)
//!   │             shared queue (+ batch into private queue)
//!   │                              ▼
//!   │   steal from another worker's private queue
//!   │                              ▼
//!   └── run / idle wait on wake channel (idle_sleep or next due retry)
//! ```
//!
//! A worker never holds a scheduler lock while a task body runs.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Steal, Worker};
use delve_sync::WaitFreeCounter;
use tracing::{debug, info, trace, warn};

use crate::capability::CapabilitySet;
use crate::config::WorkerPriority;
use crate::numa::{self, AffinityMask};
use crate::queue::QueuedTask;
use crate::scheduler::SchedulerShared;
use crate::task::{TaskEntry, TaskId};

/// How many queue candidates a worker inspects before idling.
const CLAIM_ATTEMPTS: usize = 8;

/// Worker identifier, unique per scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

/// Descriptor of a worker thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    /// Worker id.
    pub id: WorkerId,
    /// OS thread name.
    pub name: String,
    /// Priority hint.
    pub priority: WorkerPriority,
    /// Supported capabilities; `None` for generic workers.
    pub capabilities: Option<CapabilitySet>,
    /// NUMA node the worker was placed on.
    pub numa_node: Option<usize>,
    /// Cores the worker may run on.
    pub affinity: Option<AffinityMask>,
    /// Whether the worker pins itself to `affinity`.
    pub pinned: bool,
    /// Task attempts executed so far.
    pub tasks_executed: u64,
    /// Tasks taken from other workers' private queues.
    pub tasks_stolen: u64,
}

impl WorkerInfo {
    /// Whether this worker may run a task tagged `required`.
    #[must_use]
    pub fn supports(&self, required: CapabilitySet) -> bool {
        self.capabilities.is_some_and(|caps| caps.contains(required))
    }
}

/// Parameters for spawning one worker.
#[derive(Clone, Debug)]
pub(crate) struct WorkerSpec {
    pub capabilities: Option<CapabilitySet>,
    pub priority: WorkerPriority,
    pub numa_node: Option<usize>,
    pub affinity: Option<AffinityMask>,
    pub pin: bool,
}

/// Registry entry: static descriptor plus live counters.
pub(crate) struct WorkerSlot {
    info: WorkerInfo,
    executed: WaitFreeCounter,
    stolen: WaitFreeCounter,
}

impl WorkerSlot {
    pub fn id(&self) -> WorkerId {
        self.info.id
    }

    pub fn capabilities(&self) -> Option<CapabilitySet> {
        self.info.capabilities
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            tasks_executed: u64::try_from(self.executed.get()).unwrap_or_default(),
            tasks_stolen: u64::try_from(self.stolen.get()).unwrap_or_default(),
            ..self.info.clone()
        }
    }
}

/// Picks the next task id for a worker, or `None` when nothing suits it.
pub(crate) type TaskSelector = fn(&SchedulerShared, &WorkerContext) -> Option<TaskId>;

/// Thread-owned worker state.
pub(crate) struct WorkerContext {
    slot: Arc<WorkerSlot>,
    local: Worker<TaskId>,
    selector: TaskSelector,
    steal_cursor: Cell<usize>,
}

impl WorkerContext {
    pub fn id(&self) -> WorkerId {
        self.slot.id()
    }

    /// Whether this worker is allowed to run `entry`.
    pub fn can_run(&self, entry: &TaskEntry) -> bool {
        match self.slot.capabilities() {
            Some(supported) => entry
                .config
                .capabilities
                .map_or(true, |required| required.is_subset_of(supported)),
            None => !entry.routed_to_specialists,
        }
    }

    fn accepts(&self, task: &QueuedTask) -> bool {
        match (self.slot.capabilities(), task.capabilities) {
            (Some(supported), Some(required)) => required.is_subset_of(supported),
            _ => true,
        }
    }
}

/// Generic selector: shared queue, moving a batch into the private queue.
fn select_generic(shared: &SchedulerShared, ctx: &WorkerContext) -> Option<TaskId> {
    let batch = shared
        .shared_queue
        .lock()
        .pop_batch(1 + shared.config.local_batch, |_| true);
    let mut batch = batch.into_iter();
    let first = batch.next()?;
    for task in batch {
        ctx.local.push(task.id);
    }
    Some(first.id)
}

/// Specialized selector: capability queue first, then matching shared tasks.
fn select_specialized(shared: &SchedulerShared, ctx: &WorkerContext) -> Option<TaskId> {
    let routed = shared
        .capability_queue
        .lock()
        .pop_matching(|t| ctx.accepts(t));
    if let Some(task) = routed {
        return Some(task.id);
    }
    shared
        .shared_queue
        .lock()
        .pop_matching(|t| ctx.accepts(t))
        .map(|t| t.id)
}

fn steal(shared: &SchedulerShared, ctx: &WorkerContext) -> Option<TaskId> {
    let stealers = shared.stealers.read();
    let count = stealers.len();
    if count < 2 {
        return None;
    }
    let start = ctx.steal_cursor.get();
    ctx.steal_cursor.set(start.wrapping_add(1));

    for offset in 0..count {
        let (victim, stealer) = &stealers[(start + offset) % count];
        if *victim == ctx.id() {
            continue;
        }
        loop {
            match stealer.steal() {
                Steal::Success(id) => {
                    trace!(worker = %ctx.id(), %victim, task = %id, "stole task");
                    ctx.slot.stolen.increment();
                    shared.stats.steals.increment();
                    return Some(id);
                }
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
    }
    None
}

fn next_candidate(shared: &SchedulerShared, ctx: &WorkerContext) -> Option<TaskId> {
    ctx.local
        .pop()
        .or_else(|| (ctx.selector)(shared, ctx))
        .or_else(|| steal(shared, ctx))
}

/// Finds a task and moves it to `Running`.
fn find_task(shared: &SchedulerShared, ctx: &WorkerContext) -> Option<Arc<TaskEntry>> {
    for _ in 0..CLAIM_ATTEMPTS {
        let id = next_candidate(shared, ctx)?;
        if let Some(entry) = shared.claim(id, ctx) {
            return Some(entry);
        }
    }
    None
}

fn run(shared: Arc<SchedulerShared>, ctx: WorkerContext, pin: Option<AffinityMask>) {
    if let Some(mask) = pin {
        match numa::pin_current_thread(&mask) {
            Ok(()) => debug!(worker = %ctx.id(), cores = ?mask, "worker pinned"),
            Err(e) => warn!(worker = %ctx.id(), error = %e, "failed to pin worker, running unpinned"),
        }
    }

    while !shared.is_shutdown() {
        shared.run_periodic_cleanup();
        shared.promote_due_retries();
        match find_task(&shared, &ctx) {
            Some(entry) => {
                ctx.slot.executed.increment();
                shared.execute(&entry);
            }
            None => shared.idle_wait(),
        }
    }

    // Hand back anything still queued privately
    while let Some(id) = ctx.local.pop() {
        shared.requeue_id(id);
    }
    debug!(worker = %ctx.id(), "worker stopped");
}

/// Registers and starts a worker thread.
pub(crate) fn spawn_worker(
    shared: &Arc<SchedulerShared>,
    spec: WorkerSpec,
) -> std::io::Result<(WorkerId, JoinHandle<()>)> {
    let id = shared.allocate_worker_id();
    let name = match spec.capabilities {
        Some(_) => format!("delve-special-{}", id.0),
        None => format!("delve-worker-{}", id.0),
    };
    let slot = Arc::new(WorkerSlot {
        info: WorkerInfo {
            id,
            name: name.clone(),
            priority: spec.priority,
            capabilities: spec.capabilities,
            numa_node: spec.numa_node,
            affinity: spec.affinity.clone(),
            pinned: spec.pin,
            tasks_executed: 0,
            tasks_stolen: 0,
        },
        executed: WaitFreeCounter::default(),
        stolen: WaitFreeCounter::default(),
    });

    let local = Worker::new_fifo();
    let stealer = local.stealer();
    let ctx = WorkerContext {
        slot: Arc::clone(&slot),
        local,
        selector: if spec.capabilities.is_some() {
            select_specialized
        } else {
            select_generic
        },
        steal_cursor: Cell::new(id.0 + 1),
    };

    // Registered before the thread starts so routing sees it immediately
    shared.register_worker(slot, stealer);

    let pin = if spec.pin { spec.affinity } else { None };
    let thread_shared = Arc::clone(shared);
    match thread::Builder::new()
        .name(name)
        .spawn(move || run(thread_shared, ctx, pin))
    {
        Ok(handle) => {
            info!(
                worker = %id,
                capabilities = ?spec.capabilities,
                node = ?spec.numa_node,
                "worker spawned"
            );
            Ok((id, handle))
        }
        Err(e) => {
            shared.unregister_worker(id);
            Err(e)
        }
    }
}
