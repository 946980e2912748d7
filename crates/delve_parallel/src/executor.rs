//! # Parallel Executor
//!
//! Fork-join loops over `0..count` or over a zone list. The calling thread
//! always participates; helpers are scoped threads that end with the run.
//!
//! ## Execution
//!
//! ```text
//!   caller ──► plan ──► Static:  thread i owns a deque of chunks,
//!                                 empty deque → steal from others
//!                       Guided:  threads claim from a shared cursor
//!                       Sequential: caller runs 0..count
//!            ◄── join ── ParallelReport
//! ```
//!
//! ## Rules
//!
//! 1. **Runs on one executor are serialized** - a second caller blocks
//! 2. **Nested runs execute inline** - a loop started from inside one of
//!    this executor's items runs sequentially on that thread
//! 3. **Cancellation is checked between items** - items never start after
//!    the flag is observed, running items finish
//! 4. **The cancel flag resets when a run starts**
//! 5. **A panicking item ends the run** - the panic reaches the caller and
//!    the executor is idle again afterwards

use std::cell::RefCell;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_deque::{Steal, Stealer, Worker};
use crossbeam_utils::CachePadded;
use delve_sync::{WaitFreeCounter, ZoneId};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::config::ParallelConfig;
use crate::error::ParallelResult;
use crate::partition::{self, ExecutionMode, Plan};

/// Summary of one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParallelReport {
    /// Mode the caller asked for.
    pub mode: ExecutionMode,
    /// Items in the index space.
    pub total_items: usize,
    /// Items actually processed.
    pub processed_items: usize,
    /// Chunks executed.
    pub chunks: usize,
    /// Threads used, including the caller.
    pub threads: usize,
    /// Chunks taken from another thread's queue.
    pub steals: usize,
    /// Whether the run was cut short by [`ParallelExecutor::cancel`].
    pub cancelled: bool,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl ParallelReport {
    /// Whether every item was processed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.processed_items == self.total_items
    }

    /// Items left unprocessed.
    #[must_use]
    pub fn unprocessed_items(&self) -> usize {
        self.total_items - self.processed_items
    }
}

/// Lifetime counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParallelStats {
    /// Runs started.
    pub runs: u64,
    /// Runs that used more than one thread.
    pub parallel_runs: u64,
    /// Runs that stopped early due to cancellation.
    pub cancelled_runs: u64,
    /// Items processed across all runs.
    pub items_processed: u64,
    /// Chunks executed across all runs.
    pub chunks_executed: u64,
    /// Chunks stolen across all runs.
    pub steals: u64,
}

#[derive(Debug, Default)]
struct Counters {
    runs: WaitFreeCounter,
    parallel_runs: WaitFreeCounter,
    cancelled_runs: WaitFreeCounter,
    items_processed: WaitFreeCounter,
    chunks_executed: WaitFreeCounter,
    steals: WaitFreeCounter,
}

fn count(counter: &WaitFreeCounter) -> u64 {
    u64::try_from(counter.get()).unwrap_or_default()
}

fn as_delta(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Per-run progress, shared by every participating thread.
#[derive(Debug, Default)]
struct RunState {
    total_items: AtomicUsize,
    processed_items: CachePadded<AtomicUsize>,
    finished_chunks: CachePadded<AtomicUsize>,
    steals: AtomicUsize,
}

/// A chunk body: processes a range and returns how many items it finished.
type ChunkBody<'a> = dyn Fn(Range<usize>) -> usize + Sync + 'a;

thread_local! {
    /// Executors whose run the current thread is taking part in.
    static PARTICIPATING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as working for one executor's run.
struct Participant {
    executor: usize,
}

impl Participant {
    fn enter(executor: &ParallelExecutor) -> Self {
        let executor = executor.key();
        PARTICIPATING.with(|active| active.borrow_mut().push(executor));
        Self { executor }
    }

    fn is_participating(executor: &ParallelExecutor) -> bool {
        let executor = executor.key();
        PARTICIPATING.with(|active| active.borrow().contains(&executor))
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        PARTICIPATING.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|&e| e == self.executor) {
                active.remove(pos);
            }
        });
    }
}

/// Closes a run on every exit path, unwinding included: publishes the
/// lifetime counters, clears the running flag and wakes waiters.
struct ActiveRun<'a> {
    executor: &'a ParallelExecutor,
    count: usize,
    threads: usize,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        let executor = self.executor;
        let (processed, chunks, steals, cancelled) = executor.run_totals(self.count);

        executor.counters.runs.increment();
        if self.threads > 1 {
            executor.counters.parallel_runs.increment();
        }
        if cancelled {
            executor.counters.cancelled_runs.increment();
        }
        executor.counters.items_processed.add(as_delta(processed));
        executor.counters.chunks_executed.add(as_delta(chunks));
        executor.counters.steals.add(as_delta(steals));

        executor.active.store(false, Ordering::Release);
        let _guard = executor.done_lock.lock();
        executor.done.notify_all();
    }
}

/// Data-parallel loop executor.
pub struct ParallelExecutor {
    config: ParallelConfig,
    threads: usize,
    run_lock: Mutex<()>,
    cancelled: AtomicBool,
    active: AtomicBool,
    state: RunState,
    done_lock: Mutex<()>,
    done: Condvar,
    counters: Counters,
}

impl ParallelExecutor {
    /// Creates an executor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when `config` fails validation.
    pub fn new(config: ParallelConfig) -> ParallelResult<Self> {
        config.validate()?;
        let threads = config.resolved_threads();
        debug!(threads, "parallel executor created");
        Ok(Self {
            config,
            threads,
            run_lock: Mutex::new(()),
            cancelled: AtomicBool::new(false),
            active: AtomicBool::new(false),
            state: RunState::default(),
            done_lock: Mutex::new(()),
            done: Condvar::new(),
            counters: Counters::default(),
        })
    }

    /// Threads a run may use, including the caller.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    /// Calls `item_fn(i)` for every `i` in `0..count`.
    ///
    /// `granularity` overrides the chunk length (`None` = configured or
    /// automatic).
    pub fn parallel_for<F>(
        &self,
        count: usize,
        item_fn: F,
        mode: ExecutionMode,
        granularity: Option<usize>,
    ) -> ParallelReport
    where
        F: Fn(usize) + Sync,
    {
        let plan = partition::plan(count, mode, granularity, self.config.simd_lane_width, &self.config, self.threads);
        self.run(count, mode, plan, &|range| self.for_each_item(range, &item_fn))
    }

    /// Calls `range_fn` with disjoint ranges covering `0..count`.
    ///
    /// Cancellation is checked between ranges.
    pub fn parallel_for_range<F>(
        &self,
        count: usize,
        range_fn: F,
        mode: ExecutionMode,
        granularity: Option<usize>,
    ) -> ParallelReport
    where
        F: Fn(Range<usize>) + Sync,
    {
        let plan = partition::plan(count, mode, granularity, self.config.simd_lane_width, &self.config, self.threads);
        self.run(count, mode, plan, &|range: Range<usize>| {
            let len = range.len();
            range_fn(range);
            len
        })
    }

    /// Calls `batch_fn` with lane-aligned batches covering `0..count`.
    ///
    /// Every batch starts at a multiple of `lane_width` and, except the last,
    /// has a length that is a multiple of it. `lane_width` 0 uses the
    /// configured width.
    pub fn parallel_for_simd<F>(&self, count: usize, lane_width: usize, batch_fn: F) -> ParallelReport
    where
        F: Fn(Range<usize>) + Sync,
    {
        let lane_width = if lane_width == 0 {
            self.config.simd_lane_width
        } else {
            lane_width
        };
        let mode = ExecutionMode::SimdOptimized;
        let plan = partition::plan(count, mode, None, lane_width, &self.config, self.threads);
        self.run(count, mode, plan, &|range: Range<usize>| {
            let len = range.len();
            batch_fn(range);
            len
        })
    }

    /// Calls `zone_fn` once per distinct zone id.
    ///
    /// Ids are sorted and deduplicated, then each thread starts on one
    /// contiguous block, visited in ascending order. Idle threads may steal
    /// another thread's whole block.
    pub fn parallel_for_zones<F>(&self, zone_ids: &[ZoneId], zone_fn: F, mode: ExecutionMode) -> ParallelReport
    where
        F: Fn(ZoneId) + Sync,
    {
        let mut zones = zone_ids.to_vec();
        zones.sort_unstable();
        zones.dedup();
        let plan = partition::contiguous_plan(zones.len(), mode, &self.config, self.threads);
        self.run(zones.len(), mode, plan, &|range| {
            self.for_each_item(range, &|i| zone_fn(zones[i]))
        })
    }

    /// Requests cancellation of the current run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested for the current (or last) run.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether a run is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Blocks until no run is in progress or `timeout_ms` passes.
    ///
    /// Returns `true` if idle.
    pub fn wait(&self, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut guard = self.done_lock.lock();
        while self.is_running() {
            if self.done.wait_until(&mut guard, deadline).timed_out() {
                return !self.is_running();
            }
        }
        true
    }

    /// Fraction of the current (or last) run's items processed.
    #[must_use]
    pub fn progress(&self) -> f32 {
        let total = self.state.total_items.load(Ordering::Acquire);
        if total == 0 {
            return 1.0;
        }
        let processed = self.state.processed_items.load(Ordering::Acquire);
        #[allow(clippy::cast_precision_loss)]
        let fraction = processed as f32 / total as f32;
        fraction.min(1.0)
    }

    /// Lifetime counters.
    #[must_use]
    pub fn stats(&self) -> ParallelStats {
        ParallelStats {
            runs: count(&self.counters.runs),
            parallel_runs: count(&self.counters.parallel_runs),
            cancelled_runs: count(&self.counters.cancelled_runs),
            items_processed: count(&self.counters.items_processed),
            chunks_executed: count(&self.counters.chunks_executed),
            steals: count(&self.counters.steals),
        }
    }

    // =========================================================================
    // Engine
    // =========================================================================

    fn for_each_item(&self, range: Range<usize>, item_fn: &(dyn Fn(usize) + Sync)) -> usize {
        let mut done = 0;
        for i in range {
            if self.is_cancelled() {
                break;
            }
            item_fn(i);
            done += 1;
        }
        done
    }

    /// Identity used to recognise nested runs.
    fn key(&self) -> usize {
        std::ptr::addr_of!(*self) as usize
    }

    /// Processed items, chunks, steals and cancellation of the current run.
    fn run_totals(&self, count: usize) -> (usize, usize, usize, bool) {
        let processed = self.state.processed_items.load(Ordering::Acquire);
        let chunks = self.state.finished_chunks.load(Ordering::Acquire);
        let steals = self.state.steals.load(Ordering::Acquire);
        let cancelled = self.is_cancelled() && processed < count;
        (processed, chunks, steals, cancelled)
    }

    fn run(&self, count: usize, mode: ExecutionMode, plan: Plan, body: &ChunkBody<'_>) -> ParallelReport {
        if Participant::is_participating(self) {
            return self.run_nested(count, mode, body);
        }

        let _serialized = self.run_lock.lock();
        let _participant = Participant::enter(self);
        let started = Instant::now();

        self.cancelled.store(false, Ordering::Release);
        self.state.total_items.store(count, Ordering::Release);
        self.state.processed_items.store(0, Ordering::Release);
        self.state.finished_chunks.store(0, Ordering::Release);
        self.state.steals.store(0, Ordering::Release);
        self.active.store(true, Ordering::Release);

        let threads = plan.threads();
        let active = ActiveRun {
            executor: self,
            count,
            threads,
        };
        if count > 0 {
            match plan {
                Plan::Sequential => {
                    if !self.is_cancelled() {
                        self.complete_chunk(body(0..count));
                    }
                }
                Plan::Static { per_thread } => self.run_static(per_thread, body),
                Plan::Guided { threads, min_chunk } => self.run_guided(count, threads, min_chunk, body),
            }
        }

        drop(active);
        let (processed, chunks, steals, cancelled) = self.run_totals(count);

        let report = ParallelReport {
            mode,
            total_items: count,
            processed_items: processed,
            chunks,
            threads,
            steals,
            cancelled,
            elapsed: started.elapsed(),
        };
        debug!(?mode, count, processed, threads, chunks, steals, cancelled, "parallel run finished");
        report
    }

    /// Runs a loop issued from inside one of this executor's items.
    ///
    /// The outer run owns the shared run state, so the nested loop runs
    /// sequentially on the calling thread and only touches the lifetime
    /// counters. It still honours [`cancel`](Self::cancel).
    fn run_nested(&self, count: usize, mode: ExecutionMode, body: &ChunkBody<'_>) -> ParallelReport {
        let started = Instant::now();
        let processed = if count == 0 || self.is_cancelled() {
            0
        } else {
            body(0..count)
        };
        let cancelled = self.is_cancelled() && processed < count;

        self.counters.runs.increment();
        self.counters.items_processed.add(as_delta(processed));
        trace!(?mode, count, processed, "nested parallel run executed inline");

        ParallelReport {
            mode,
            total_items: count,
            processed_items: processed,
            chunks: usize::from(count > 0),
            threads: 1,
            steals: 0,
            cancelled,
            elapsed: started.elapsed(),
        }
    }

    fn complete_chunk(&self, processed: usize) {
        self.state.processed_items.fetch_add(processed, Ordering::AcqRel);
        self.state.finished_chunks.fetch_add(1, Ordering::AcqRel);
    }

    fn run_static(&self, per_thread: Vec<Vec<Range<usize>>>, body: &ChunkBody<'_>) {
        let queues: Vec<Worker<Range<usize>>> = per_thread
            .into_iter()
            .map(|chunks| {
                let queue = Worker::new_fifo();
                for chunk in chunks {
                    queue.push(chunk);
                }
                queue
            })
            .collect();
        let stealers: Vec<Stealer<Range<usize>>> = queues.iter().map(Worker::stealer).collect();
        let stealers = stealers.as_slice();

        thread::scope(|scope| {
            let mut queues = queues.into_iter().enumerate();
            let caller = queues.next();
            for (index, queue) in queues {
                scope.spawn(move || {
                    let _participant = Participant::enter(self);
                    self.drain(index, &queue, stealers, body);
                });
            }
            if let Some((index, queue)) = caller {
                self.drain(index, &queue, stealers, body);
            }
        });
    }

    fn drain(&self, index: usize, queue: &Worker<Range<usize>>, stealers: &[Stealer<Range<usize>>], body: &ChunkBody<'_>) {
        while !self.is_cancelled() {
            let Some(chunk) = queue.pop().or_else(|| self.steal(index, stealers)) else {
                break;
            };
            self.complete_chunk(body(chunk));
        }
    }

    fn steal(&self, thief: usize, stealers: &[Stealer<Range<usize>>]) -> Option<Range<usize>> {
        let count = stealers.len();
        for offset in 1..count {
            let victim = (thief + offset) % count;
            loop {
                match stealers[victim].steal() {
                    Steal::Success(chunk) => {
                        trace!(thief, victim, start = chunk.start, end = chunk.end, "stole chunk");
                        self.state.steals.fetch_add(1, Ordering::Relaxed);
                        return Some(chunk);
                    }
                    Steal::Empty => break,
                    Steal::Retry => {}
                }
            }
        }
        None
    }

    fn run_guided(&self, count: usize, threads: usize, min_chunk: usize, body: &ChunkBody<'_>) {
        let cursor = CachePadded::new(AtomicUsize::new(0));
        let cursor = &cursor;
        let claim = move || -> Option<Range<usize>> {
            cursor
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |start| {
                    (start < count).then(|| start + partition::guided_chunk(count - start, threads, min_chunk))
                })
                .ok()
                .map(|start| start..start + partition::guided_chunk(count - start, threads, min_chunk))
        };
        let work = move || {
            let _participant = Participant::enter(self);
            while !self.is_cancelled() {
                let Some(chunk) = claim() else {
                    break;
                };
                self.complete_chunk(body(chunk));
            }
        };

        thread::scope(|scope| {
            for _ in 1..threads {
                scope.spawn(work);
            }
            work();
        });
    }
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("threads", &self.threads)
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
