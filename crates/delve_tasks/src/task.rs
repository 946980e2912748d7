//! # Task Model
//!
//! A task is a unit of work plus the bookkeeping the scheduler needs to run
//! it: priority, dependencies, retry policy, capability tag, progress and
//! status.
//!
//! ## Lifecycle
//!
//! ```text
//!              ┌──── retry (delay) ────┐
//!              ▼                       │
//!   submit → Pending ──► Running ──────┼──► Completed
//!              │                       ├──► Failed
//!              │                       └──► Cancelled
//!              ├──► Cancelled   (cancel before start / shutdown)
//!              └──► Failed      (dependency failed)
//! ```
//!
//! Terminal states never change again. Every terminal transition fires the
//! completion callback exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::capability::CapabilitySet;
use crate::error::{TaskError, TaskResult};

/// Unique, monotonically increasing task identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Raw id value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Scheduling priority. Higher runs first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// Runs only when nothing else is queued.
    Background = 0,
    /// Below normal.
    Low = 1,
    /// Default priority.
    #[default]
    Normal = 2,
    /// Above normal.
    High = 3,
    /// Frame-critical work.
    Critical = 4,
}

impl TaskPriority {
    /// Number of priority levels.
    pub const COUNT: usize = 5;

    /// Every priority, highest first.
    pub const DESCENDING: [Self; Self::COUNT] = [
        Self::Critical,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Background,
    ];

    /// Queue bucket index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Task lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Waiting for dependencies, a retry delay or a worker.
    Pending,
    /// A worker is executing the body.
    Running,
    /// The body returned successfully.
    Completed,
    /// All attempts failed, or a dependency failed.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is final.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Delay between a failed attempt and the next one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry immediately.
    #[default]
    None,
    /// Wait the same delay before every retry.
    Fixed(Duration),
    /// Double the delay after every failure, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        initial: Duration,
        /// Upper bound on any delay.
        max: Duration,
    },
}

impl RetryStrategy {
    /// Delay after `failed_attempts` attempts have failed (1-based).
    #[must_use]
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => {
                let shift = failed_attempts.saturating_sub(1).min(31);
                initial.checked_mul(1u32 << shift).map_or(max, |d| d.min(max))
            }
        }
    }
}

/// Per-task scheduling options.
#[derive(Clone, Debug)]
pub struct TaskConfig {
    /// Queue priority.
    pub priority: TaskPriority,
    /// Attempt deadline. Bodies see it through [`TaskContext::should_stop`];
    /// an attempt that overruns it fails with [`TaskError::TimedOut`].
    pub timeout: Option<Duration>,
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    /// Delay policy between attempts.
    pub retry: RetryStrategy,
    /// Tasks that must complete first.
    pub dependencies: Vec<TaskId>,
    /// Capability tag for worker routing.
    pub capabilities: Option<CapabilitySet>,
    /// Minimum spacing between progress callbacks.
    pub progress_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            priority: TaskPriority::Normal,
            timeout: None,
            max_retries: 0,
            retry: RetryStrategy::None,
            dependencies: Vec::new(),
            capabilities: None,
            progress_interval: Duration::from_millis(100),
        }
    }
}

impl TaskConfig {
    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the attempt deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Allows `max_retries` extra attempts spaced by `retry`.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, retry: RetryStrategy) -> Self {
        self.max_retries = max_retries;
        self.retry = retry;
        self
    }

    /// Adds one prerequisite.
    #[must_use]
    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Adds several prerequisites.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    /// Tags the task for specialized workers.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Sets the minimum spacing between progress callbacks.
    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Progress report delivered to progress callbacks.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskProgress {
    /// Reporting task.
    pub id: TaskId,
    /// Completion fraction in `[0, 1]`.
    pub fraction: f32,
    /// Optional status line.
    pub message: Option<String>,
    /// Attempt that reported it (1-based).
    pub attempt: u32,
}

/// Final result delivered to completion callbacks.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskOutcome {
    /// Finished task.
    pub id: TaskId,
    /// Terminal status.
    pub status: TaskStatus,
    /// Attempts made (0 if it never ran).
    pub attempts: u32,
    /// Why it did not complete.
    pub error: Option<TaskError>,
    /// Time from the last start to the terminal transition.
    pub run_time: Option<Duration>,
}

impl TaskOutcome {
    /// Whether the task completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Point-in-time view of a task.
#[derive(Clone, Debug)]
pub struct TaskSnapshot {
    /// Task id.
    pub id: TaskId,
    /// Description given at submission.
    pub description: String,
    /// Current status.
    pub status: TaskStatus,
    /// Queue priority.
    pub priority: TaskPriority,
    /// Capability tag.
    pub capabilities: Option<CapabilitySet>,
    /// Attempts started so far.
    pub attempts: u32,
    /// Last reported progress.
    pub progress: f32,
    /// Last progress message.
    pub progress_message: Option<String>,
    /// Submission time.
    pub created_at: Instant,
    /// Start of the latest attempt.
    pub started_at: Option<Instant>,
    /// Terminal transition time.
    pub completed_at: Option<Instant>,
    /// Last error.
    pub error: Option<TaskError>,
}

pub(crate) type TaskWork = Box<dyn FnMut(&TaskContext) -> TaskResult + Send>;
pub(crate) type CompletionCallback = Box<dyn FnOnce(&TaskOutcome) + Send>;
pub(crate) type ProgressCallback = Arc<dyn Fn(&TaskProgress) + Send + Sync>;

/// Mutable part of a task record.
#[derive(Debug)]
pub(crate) struct TaskState {
    pub status: TaskStatus,
    pub attempts: u32,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub retry_at: Option<Instant>,
    pub error: Option<TaskError>,
    pub progress_message: Option<String>,
    /// Terminal and the completion callback has returned.
    pub settled: bool,
}

/// Task record shared between the scheduler map, queues and workers.
pub(crate) struct TaskEntry {
    pub id: TaskId,
    pub description: String,
    pub config: TaskConfig,
    pub created_at: Instant,
    /// Routed to the capability queue at submission.
    pub routed_to_specialists: bool,
    pub state: Mutex<TaskState>,
    pub cancel_requested: AtomicBool,
    progress_bits: AtomicU32,
    pub work: Mutex<Option<TaskWork>>,
    pub on_complete: Mutex<Option<CompletionCallback>>,
    on_progress: Mutex<Option<ProgressCallback>>,
    last_progress_report: Mutex<Option<Instant>>,
}

impl TaskEntry {
    pub fn new(
        id: TaskId,
        description: String,
        config: TaskConfig,
        routed_to_specialists: bool,
        work: TaskWork,
        on_complete: Option<CompletionCallback>,
    ) -> Self {
        Self {
            id,
            description,
            config,
            created_at: Instant::now(),
            routed_to_specialists,
            state: Mutex::new(TaskState {
                status: TaskStatus::Pending,
                attempts: 0,
                started_at: None,
                completed_at: None,
                retry_at: None,
                error: None,
                progress_message: None,
                settled: false,
            }),
            cancel_requested: AtomicBool::new(false),
            progress_bits: AtomicU32::new(0f32.to_bits()),
            work: Mutex::new(Some(work)),
            on_complete: Mutex::new(on_complete),
            on_progress: Mutex::new(None),
            last_progress_report: Mutex::new(None),
        }
    }

    #[inline]
    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    #[inline]
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.progress_bits.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub fn set_progress_callback(&self, callback: ProgressCallback) {
        *self.on_progress.lock() = Some(callback);
    }

    /// Stores progress and, when due, invokes the progress callback.
    ///
    /// Called from the worker thread running the body. The callback runs
    /// with no lock held.
    pub fn report_progress(&self, fraction: f32, message: Option<String>, attempt: u32) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.progress_bits.store(fraction.to_bits(), Ordering::Release);
        self.state.lock().progress_message.clone_from(&message);

        let Some(callback) = self.on_progress.lock().clone() else {
            return;
        };
        {
            let mut last = self.last_progress_report.lock();
            let now = Instant::now();
            let due = fraction >= 1.0
                || last.map_or(true, |at| now.duration_since(at) >= self.config.progress_interval);
            if !due {
                return;
            }
            *last = Some(now);
        }
        callback(&TaskProgress {
            id: self.id,
            fraction,
            message,
            attempt,
        });
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock();
        TaskSnapshot {
            id: self.id,
            description: self.description.clone(),
            status: state.status,
            priority: self.config.priority,
            capabilities: self.config.capabilities,
            attempts: state.attempts,
            progress: self.progress(),
            progress_message: state.progress_message.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            error: state.error.clone(),
        }
    }
}

impl fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEntry")
            .field("id", &self.id)
            .field("description", &self.description)
            .field("priority", &self.config.priority)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

/// Handle passed to a running task body.
///
/// Cancellation and deadlines are cooperative: long bodies should poll
/// [`should_stop`](Self::should_stop) between units of work.
pub struct TaskContext {
    entry: Arc<TaskEntry>,
    attempt: u32,
    deadline: Option<Instant>,
}

impl TaskContext {
    pub(crate) fn new(entry: Arc<TaskEntry>, attempt: u32, deadline: Option<Instant>) -> Self {
        Self {
            entry,
            attempt,
            deadline,
        }
    }

    /// Id of the running task.
    #[inline]
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.entry.id
    }

    /// Description given at submission.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.entry.description
    }

    /// Current attempt, starting at 1.
    #[inline]
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether cancellation has been requested.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.entry.is_cancel_requested()
    }

    /// Whether the attempt deadline has passed.
    #[must_use]
    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Whether the body should stop early (cancelled or past its deadline).
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.deadline_exceeded()
    }

    /// Records progress in `[0, 1]` with an optional message.
    ///
    /// The progress callback, if any, is rate-limited by the task's
    /// `progress_interval`; a report of 1.0 is always delivered.
    pub fn report_progress(&self, fraction: f32, message: Option<&str>) {
        self.entry
            .report_progress(fraction, message.map(str::to_string), self.attempt);
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.entry.id)
            .field("attempt", &self.attempt)
            .field("deadline", &self.deadline)
            .finish()
    }
}
