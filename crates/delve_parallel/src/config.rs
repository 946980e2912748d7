//! # Parallel Executor Configuration
//!
//! Read from the `[parallel]` table of the host config. All sizes are in
//! items unless the name says bytes.

use serde::Deserialize;

use crate::error::{ParallelError, ParallelResult};

/// Tuning knobs for [`ParallelExecutor`](crate::ParallelExecutor).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Threads per run including the caller. `None` uses the core count.
    pub max_threads: Option<usize>,
    /// Below this count, non-forced modes run on the caller only.
    pub min_parallel_items: usize,
    /// Items per chunk when the caller gives no granularity. 0 = automatic.
    pub default_granularity: usize,
    /// Lane width used by SIMD mode when the caller passes 0.
    pub simd_lane_width: usize,
    /// Target bytes per chunk in cache mode (about one L2 slice).
    pub cache_chunk_bytes: usize,
    /// Assumed bytes touched per item in cache mode.
    pub item_size_hint: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_threads: None,
            min_parallel_items: 256,
            default_granularity: 0,
            simd_lane_width: 8,          // AVX2 f32 lanes
            cache_chunk_bytes: 32 * 1024, // L1d-sized blocks
            item_size_hint: 64,           // One cache line per item
        }
    }
}

impl ParallelConfig {
    /// Config with a fixed thread count and no parallel threshold, for tests.
    #[must_use]
    pub fn with_threads(threads: usize) -> Self {
        Self {
            max_threads: Some(threads),
            min_parallel_items: 2,
            ..Self::default()
        }
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> ParallelResult<()> {
        if self.max_threads == Some(0) {
            return Err(ParallelError::InvalidConfig("max_threads must be at least 1".into()));
        }
        if self.simd_lane_width == 0 {
            return Err(ParallelError::InvalidConfig("simd_lane_width must be at least 1".into()));
        }
        if self.cache_chunk_bytes == 0 || self.item_size_hint == 0 {
            return Err(ParallelError::InvalidConfig(
                "cache_chunk_bytes and item_size_hint must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Thread count after applying the core-count default.
    #[must_use]
    pub fn resolved_threads(&self) -> usize {
        self.max_threads.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Items per cache-mode chunk.
    #[must_use]
    pub fn cache_chunk_items(&self) -> usize {
        (self.cache_chunk_bytes / self.item_size_hint.max(1)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ParallelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_chunk_items(), 512);
        assert!(config.resolved_threads() >= 1);
    }

    #[test]
    fn test_rejects_zero_lanes() {
        let config = ParallelConfig {
            simd_lane_width: 0,
            ..ParallelConfig::default()
        };
        assert!(matches!(config.validate(), Err(ParallelError::InvalidConfig(_))));
        assert!(ParallelConfig::with_threads(0).validate().is_err());
    }
}
