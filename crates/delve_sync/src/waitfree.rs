//! # Wait-Free Counters and Versioned Tables
//!
//! - [`WaitFreeCounter`]: a cache-padded atomic integer. Every operation is
//!   a single atomic instruction and never blocks.
//! - [`VersionedTable`]: a keyed table whose version number is bumped on
//!   every structural mutation. Readers that need several lookups to agree
//!   with each other compare versions before and after, and retry on
//!   mismatch (optimistic reads, no torn multi-read sequences).

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::RwLock;

/// Atomic signed counter.
///
/// Padded to a cache line so neighbouring counters don't false-share.
pub struct WaitFreeCounter {
    value: CachePadded<AtomicI64>,
}

impl WaitFreeCounter {
    /// Creates a counter starting at `initial`.
    #[must_use]
    pub fn new(initial: i64) -> Self {
        Self {
            value: CachePadded::new(AtomicI64::new(initial)),
        }
    }

    /// Current value.
    #[inline]
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Overwrites the value.
    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Adds one and returns the NEW value.
    #[inline]
    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    /// Subtracts one and returns the NEW value.
    #[inline]
    pub fn decrement(&self) -> i64 {
        self.add(-1)
    }

    /// Adds `delta` (wrapping) and returns the NEW value.
    #[inline]
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::AcqRel).wrapping_add(delta)
    }

    /// Stores `value` and returns the PREVIOUS value.
    #[inline]
    pub fn exchange(&self, value: i64) -> i64 {
        self.value.swap(value, Ordering::AcqRel)
    }

    /// Stores `new` if the counter equals `current`.
    ///
    /// # Errors
    ///
    /// Returns the actual value when it was not `current`.
    #[inline]
    pub fn compare_exchange(&self, current: i64, new: i64) -> Result<i64, i64> {
        self.value
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

impl Default for WaitFreeCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

impl fmt::Debug for WaitFreeCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WaitFreeCounter").field(&self.get()).finish()
    }
}

/// Keyed table with a structural version number.
///
/// Inserts, removals and clears bump the version while the write lock is
/// held. Point reads are always consistent on their own; use
/// [`read_validated`](Self::read_validated) when several reads must agree.
pub struct VersionedTable<K, V> {
    version: AtomicU64,
    entries: RwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> VersionedTable<K, V> {
    /// Creates an empty table at version 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Current structural version.
    #[inline]
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Whether no mutation happened since `version` was observed.
    #[inline]
    #[must_use]
    pub fn is_current(&self, version: u64) -> bool {
        self.version() == version
    }

    /// Inserts or replaces an entry. Returns the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut entries = self.entries.write();
        let previous = entries.insert(key, value);
        self.version.fetch_add(1, Ordering::AcqRel);
        previous
    }

    /// Removes an entry. The version only moves if something was removed.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.write();
        let removed = entries.remove(key);
        if removed.is_some() {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            entries.clear();
            self.version.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Whether `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Runs `read` against the table under a shared lock.
    pub fn with_entries<R>(&self, read: impl FnOnce(&HashMap<K, V>) -> R) -> R {
        read(&self.entries.read())
    }

    /// Runs `read` until the version is unchanged across the whole call.
    ///
    /// `read` may perform any number of separate lookups; the result is
    /// returned together with the version it is consistent with.
    pub fn read_validated<R>(&self, mut read: impl FnMut(&Self) -> R) -> (R, u64) {
        loop {
            let before = self.version();
            let result = read(self);
            if self.is_current(before) {
                return (result, before);
            }
        }
    }
}

impl<K: Eq + Hash, V: Clone> VersionedTable<K, V> {
    /// Clones the value for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Clones the value for `key` together with the version it was read at.
    #[must_use]
    pub fn get_versioned(&self, key: &K) -> (Option<V>, u64) {
        let entries = self.entries.read();
        (entries.get(key).cloned(), self.version())
    }
}

impl<K: Eq + Hash + Clone, V: Clone> VersionedTable<K, V> {
    /// Consistent copy of the whole table and its version.
    #[must_use]
    pub fn snapshot(&self) -> (HashMap<K, V>, u64) {
        let entries = self.entries.read();
        (entries.clone(), self.version())
    }
}

impl<K: Eq + Hash, V> Default for VersionedTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for VersionedTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedTable")
            .field("version", &self.version.load(Ordering::Relaxed))
            .field("len", &self.entries.read().len())
            .finish()
    }
}
