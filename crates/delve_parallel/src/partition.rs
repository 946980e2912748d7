//! # Work Partitioning
//!
//! Turns `(count, mode, granularity)` into a [`Plan`]: either a sequential
//! run, a static set of chunks dealt to threads up front, or guided
//! self-scheduling from a shared cursor.
//!
//! ```text
//!   Automatic / ForceParallel   round-robin:  t0:[0] [3]  t1:[1] [4]  t2:[2]
//!   SimdOptimized               same, chunk length rounded up to lane width
//!   CacheOptimized / zones      contiguous:   t0:[0][1]   t1:[2][3]   t2:[4]
//!   Adaptive                    guided:       chunk = remaining / (2 × threads)
//! ```

use std::ops::Range;

use crate::config::ParallelConfig;

/// How a loop is executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Parallel above `min_parallel_items`, round-robin chunks.
    #[default]
    Automatic,
    /// Parallel for any count of at least 2.
    ForceParallel,
    /// Always on the calling thread.
    ForceSequential,
    /// Chunks aligned to the SIMD lane width.
    SimdOptimized,
    /// Cache-sized chunks in contiguous per-thread blocks.
    CacheOptimized,
    /// Guided self-scheduling for uneven per-item cost.
    Adaptive,
}

/// Execution plan for one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Run `0..count` on the calling thread.
    Sequential,
    /// Pre-built chunks, one list per thread (thread 0 is the caller).
    Static {
        /// Chunks queued on each thread.
        per_thread: Vec<Vec<Range<usize>>>,
    },
    /// Threads claim shrinking chunks from a shared cursor.
    Guided {
        /// Threads including the caller.
        threads: usize,
        /// Smallest chunk handed out.
        min_chunk: usize,
    },
}

impl Plan {
    /// Threads the plan runs on, including the caller.
    #[must_use]
    pub fn threads(&self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Static { per_thread } => per_thread.len().max(1),
            Self::Guided { threads, .. } => *threads,
        }
    }

    /// Whether more than one thread is used.
    #[must_use]
    pub fn is_parallel(&self) -> bool {
        self.threads() > 1
    }
}

/// Automatic chunk length: about four chunks per thread.
#[must_use]
pub fn auto_granularity(count: usize, threads: usize) -> usize {
    (count / (threads.max(1) * 4)).max(1)
}

/// Rounds `value` up to a multiple of `multiple` (at least one multiple).
#[must_use]
pub fn round_up(value: usize, multiple: usize) -> usize {
    let multiple = multiple.max(1);
    value.max(1).div_ceil(multiple) * multiple
}

/// Splits `0..count` into consecutive chunks of `chunk` items (last may be
/// shorter).
#[must_use]
pub fn split(count: usize, chunk: usize) -> Vec<Range<usize>> {
    let chunk = chunk.max(1);
    (0..count)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(count))
        .collect()
}

/// Deals chunks round-robin over at most `threads` threads.
#[must_use]
pub fn deal_round_robin(chunks: Vec<Range<usize>>, threads: usize) -> Vec<Vec<Range<usize>>> {
    let threads = threads.clamp(1, chunks.len().max(1));
    let mut per_thread = vec![Vec::new(); threads];
    for (i, chunk) in chunks.into_iter().enumerate() {
        per_thread[i % threads].push(chunk);
    }
    per_thread
}

/// Deals chunks as contiguous blocks over at most `threads` threads.
#[must_use]
pub fn deal_contiguous(chunks: Vec<Range<usize>>, threads: usize) -> Vec<Vec<Range<usize>>> {
    let threads = threads.clamp(1, chunks.len().max(1));
    let per_block = chunks.len().div_ceil(threads).max(1);
    let mut per_thread: Vec<Vec<Range<usize>>> = Vec::with_capacity(threads);
    let mut chunks = chunks.into_iter().peekable();
    while chunks.peek().is_some() {
        per_thread.push(chunks.by_ref().take(per_block).collect());
    }
    per_thread
}

/// Next guided chunk length.
#[must_use]
pub fn guided_chunk(remaining: usize, threads: usize, min_chunk: usize) -> usize {
    (remaining / (2 * threads.max(1)))
        .max(min_chunk.max(1))
        .min(remaining)
}

/// Whether a run of `count` items should use more than one thread.
#[must_use]
pub fn should_parallelize(count: usize, mode: ExecutionMode, config: &ParallelConfig, threads: usize) -> bool {
    if threads < 2 {
        return false;
    }
    match mode {
        ExecutionMode::ForceSequential => false,
        ExecutionMode::ForceParallel => count >= 2,
        _ => count >= config.min_parallel_items.max(2),
    }
}

/// Builds the plan for `count` items.
///
/// `granularity` overrides the configured chunk length. `lane_width` only
/// matters in SIMD mode.
#[must_use]
pub fn plan(
    count: usize,
    mode: ExecutionMode,
    granularity: Option<usize>,
    lane_width: usize,
    config: &ParallelConfig,
    threads: usize,
) -> Plan {
    if !should_parallelize(count, mode, config, threads) {
        return Plan::Sequential;
    }
    let grain = granularity
        .filter(|&g| g > 0)
        .or((config.default_granularity > 0).then_some(config.default_granularity))
        .unwrap_or_else(|| auto_granularity(count, threads));

    let per_thread = match mode {
        ExecutionMode::Adaptive => {
            return Plan::Guided {
                threads: threads.min(count),
                min_chunk: grain,
            };
        }
        ExecutionMode::SimdOptimized => deal_round_robin(split(count, round_up(grain, lane_width)), threads),
        ExecutionMode::CacheOptimized => {
            let chunk = granularity
                .filter(|&g| g > 0)
                .unwrap_or_else(|| config.cache_chunk_items());
            deal_contiguous(split(count, chunk), threads)
        }
        _ => deal_round_robin(split(count, grain), threads),
    };

    if per_thread.len() < 2 {
        Plan::Sequential
    } else {
        Plan::Static { per_thread }
    }
}

/// Contiguous one-block-per-thread plan, used for zone lists.
#[must_use]
pub fn contiguous_plan(count: usize, mode: ExecutionMode, config: &ParallelConfig, threads: usize) -> Plan {
    if !should_parallelize(count, mode, config, threads) {
        return Plan::Sequential;
    }
    let per_thread = deal_contiguous(split(count, count.div_ceil(threads)), threads);
    if per_thread.len() < 2 {
        Plan::Sequential
    } else {
        Plan::Static { per_thread }
    }
}
