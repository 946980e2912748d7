//! # Lock Hierarchy
//!
//! One global acquisition order across lock categories:
//!
//! ```text
//!   Service < Zone < Material < Octree < Field
//!   (outer)                             (inner)
//! ```
//!
//! Every thread keeps a thread-local history of the levels it currently
//! holds. Acquiring a level that is not strictly deeper than everything
//! already held is a hierarchy violation.
//!
//! ## Fail-open
//!
//! [`HierarchicalMutex::lock`] LOGS violations and still acquires. The
//! validator is an instrumentation aid for catching ordering bugs in
//! development and tests, not a runtime safety net. Use
//! [`HierarchicalMutex::lock_strict`] where refusing is preferable.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{SyncError, SyncResult};

/// Wait or hold time after which a lock is reported as a suspected deadlock.
pub const DEFAULT_DEADLOCK_WARNING: Duration = Duration::from_secs(1);

/// Lock categories, ordered from outermost to innermost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockLevel {
    /// Service-wide state (registries of registries, scheduler hooks).
    Service = 0,
    /// Spatial zone state.
    Zone = 1,
    /// Material registry state.
    Material = 2,
    /// Sparse octree nodes.
    Octree = 3,
    /// Distance field data.
    Field = 4,
}

impl LockLevel {
    /// All levels in acquisition order.
    pub const ALL: [LockLevel; 5] = [
        LockLevel::Service,
        LockLevel::Zone,
        LockLevel::Material,
        LockLevel::Octree,
        LockLevel::Field,
    ];

    /// Short lowercase name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            LockLevel::Service => "service",
            LockLevel::Zone => "zone",
            LockLevel::Material => "material",
            LockLevel::Octree => "octree",
            LockLevel::Field => "field",
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

thread_local! {
    static LOCK_HISTORY: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

/// Returns whether the calling thread may acquire `level` without
/// violating the hierarchy.
///
/// True when nothing is held, or when `level` is strictly deeper than the
/// highest level held.
#[must_use]
pub fn can_safely_acquire(level: LockLevel) -> bool {
    highest_held_level().map_or(true, |highest| level > highest)
}

/// Records `level` as held by the calling thread.
pub fn add_to_history(level: LockLevel) {
    LOCK_HISTORY.with(|history| history.borrow_mut().push(level));
}

/// Removes the most recent entry for `level` from the calling thread's
/// history. Returns `false` if the thread did not hold it.
pub fn remove_from_history(level: LockLevel) -> bool {
    LOCK_HISTORY.with(|history| {
        let mut history = history.borrow_mut();
        match history.iter().rposition(|held| *held == level) {
            Some(index) => {
                history.remove(index);
                true
            }
            None => false,
        }
    })
}

/// Levels currently held by the calling thread, in acquisition order.
#[must_use]
pub fn held_levels() -> Vec<LockLevel> {
    LOCK_HISTORY.with(|history| history.borrow().clone())
}

/// Deepest level currently held by the calling thread.
#[must_use]
pub fn highest_held_level() -> Option<LockLevel> {
    LOCK_HISTORY.with(|history| history.borrow().iter().copied().max())
}

/// Forgets everything the calling thread holds.
///
/// Only for resetting state between test cases; real guards keep the
/// history balanced on their own.
pub fn clear_history() {
    LOCK_HISTORY.with(|history| history.borrow_mut().clear());
}

/// Mutex tagged with a [`LockLevel`] that validates acquisition order.
///
/// ## Usage
///
/// ```rust
/// use delve_sync::{HierarchicalMutex, LockLevel};
///
/// let zones = HierarchicalMutex::new(LockLevel::Zone, "zone_table", vec![0u32; 4]);
/// let materials = HierarchicalMutex::new(LockLevel::Material, "materials", 0u64);
///
/// let mut z = zones.lock();
/// let mut m = materials.lock(); // Zone -> Material: legal order
/// z[0] += 1;
/// *m += 1;
/// ```
pub struct HierarchicalMutex<T> {
    level: LockLevel,
    name: &'static str,
    inner: Mutex<T>,
    violations: AtomicU64,
    deadlock_warning: Duration,
}

impl<T> HierarchicalMutex<T> {
    /// Creates a mutex at `level`. `name` identifies it in logs.
    pub fn new(level: LockLevel, name: &'static str, value: T) -> Self {
        Self {
            level,
            name,
            inner: Mutex::new(value),
            violations: AtomicU64::new(0),
            deadlock_warning: DEFAULT_DEADLOCK_WARNING,
        }
    }

    /// Sets the wait/hold duration after which a deadlock is suspected.
    #[must_use]
    pub fn with_deadlock_warning(mut self, threshold: Duration) -> Self {
        self.deadlock_warning = threshold;
        self
    }

    /// The category of this mutex.
    #[inline]
    #[must_use]
    pub fn level(&self) -> LockLevel {
        self.level
    }

    /// Name used in diagnostics.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Number of out-of-order acquisitions observed on this mutex.
    #[must_use]
    pub fn violation_count(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    fn check_order(&self) -> bool {
        if can_safely_acquire(self.level) {
            return true;
        }
        self.violations.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            lock = self.name,
            requested = %self.level,
            highest_held = ?highest_held_level(),
            held = ?held_levels(),
            "lock hierarchy violation"
        );
        false
    }

    fn acquire_watching(&self) -> MutexGuard<'_, T> {
        if let Some(guard) = self.inner.try_lock() {
            return guard;
        }
        let start = Instant::now();
        if let Some(guard) = self.inner.try_lock_for(self.deadlock_warning) {
            return guard;
        }
        tracing::warn!(
            lock = self.name,
            level = %self.level,
            waited_ms = start.elapsed().as_millis() as u64,
            held = ?held_levels(),
            "possible deadlock: lock wait exceeded threshold"
        );
        self.inner.lock()
    }

    fn enter<'a>(&'a self, guard: MutexGuard<'a, T>) -> HierarchicalMutexGuard<'a, T> {
        add_to_history(self.level);
        HierarchicalMutexGuard {
            mutex: self,
            guard,
            acquired_at: Instant::now(),
        }
    }

    /// Acquires the mutex, logging (not refusing) hierarchy violations.
    pub fn lock(&self) -> HierarchicalMutexGuard<'_, T> {
        self.check_order();
        let guard = self.acquire_watching();
        self.enter(guard)
    }

    /// Bounded acquisition. Returns `None` on timeout with no side effects
    /// on the thread's lock history.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<HierarchicalMutexGuard<'_, T>> {
        self.check_order();
        self.inner
            .try_lock_for(timeout)
            .map(|guard| self.enter(guard))
    }

    /// Single non-blocking attempt.
    pub fn try_lock(&self) -> Option<HierarchicalMutexGuard<'_, T>> {
        self.check_order();
        self.inner.try_lock().map(|guard| self.enter(guard))
    }

    /// Fail-closed acquisition: refuses out-of-order requests.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::HierarchyViolation`] if the calling thread
    /// already holds a level at or below this one.
    pub fn lock_strict(&self) -> SyncResult<HierarchicalMutexGuard<'_, T>> {
        if let Some(highest) = highest_held_level() {
            if self.level <= highest {
                self.violations.fetch_add(1, Ordering::Relaxed);
                return Err(SyncError::HierarchyViolation {
                    requested: self.level,
                    highest_held: highest,
                });
            }
        }
        let guard = self.acquire_watching();
        Ok(self.enter(guard))
    }

    /// Mutable access without locking; `&mut self` proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Consumes the mutex and returns the protected value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for HierarchicalMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HierarchicalMutex")
            .field("level", &self.level)
            .field("name", &self.name)
            .field("violations", &self.violation_count())
            .finish_non_exhaustive()
    }
}

/// Scoped access to a [`HierarchicalMutex`].
///
/// Pops the mutex's level from the thread's history on drop.
#[must_use = "the mutex is released as soon as the guard is dropped"]
pub struct HierarchicalMutexGuard<'a, T> {
    mutex: &'a HierarchicalMutex<T>,
    guard: MutexGuard<'a, T>,
    acquired_at: Instant,
}

impl<T> HierarchicalMutexGuard<'_, T> {
    /// How long this guard has held the mutex.
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Level of the held mutex.
    #[must_use]
    pub fn level(&self) -> LockLevel {
        self.mutex.level
    }
}

impl<T> Deref for HierarchicalMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for HierarchicalMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for HierarchicalMutexGuard<'_, T> {
    fn drop(&mut self) {
        remove_from_history(self.mutex.level);
        let held = self.held_for();
        if held > self.mutex.deadlock_warning {
            tracing::warn!(
                lock = self.mutex.name,
                level = %self.mutex.level,
                held_ms = held.as_millis() as u64,
                "lock held unusually long"
            );
        }
    }
}
