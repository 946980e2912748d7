//! # Spin Lock
//!
//! Busy-waiting lock for very short critical sections (counter bumps,
//! owner slot updates). No fairness guarantee.
//!
//! Spinning is bounded: the waiter backs off with processor yield hints
//! first, then falls back to yielding the OS thread between attempts so a
//! long-held lock does not burn a full core.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

/// A test-and-test-and-set spin lock.
///
/// This is a raw lock: it protects no data by itself. Pair it with the
/// state it guards, or use [`SpinLock::guard`] for scoped acquisition.
///
/// ## Usage
///
/// ```rust
/// use delve_sync::SpinLock;
///
/// let lock = SpinLock::new();
/// {
///     let guard = lock.guard();
///     assert!(guard.is_locked());
/// }
/// assert!(!lock.is_locked());
/// ```
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Creates an unlocked spin lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Single non-blocking acquisition attempt.
    #[inline]
    pub fn try_lock(&self) -> bool {
        // Read first so contended waiters don't hammer the cache line with CAS
        !self.locked.load(Ordering::Relaxed)
            && self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Acquires the lock, spinning (then yielding) until it is free.
    pub fn lock(&self) {
        let backoff = Backoff::new();
        while !self.try_lock() {
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Tries to acquire the lock until `timeout` elapses.
    ///
    /// Returns `false` without side effects on timeout.
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        if self.try_lock() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
            if self.try_lock() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    /// Releases the lock.
    ///
    /// Must only be called by the thread that acquired it.
    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Returns whether the lock is currently held by anyone.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Acquires the lock and returns a guard that releases it on drop.
    pub fn guard(&self) -> SpinLockGuard<'_> {
        self.lock();
        SpinLockGuard { lock: self, locked: true }
    }

    /// Single acquisition attempt wrapped in a guard.
    ///
    /// Check [`SpinLockGuard::is_locked`] before touching protected state.
    pub fn try_guard(&self) -> SpinLockGuard<'_> {
        let locked = self.try_lock();
        SpinLockGuard { lock: self, locked }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Scoped guard for a [`SpinLock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
    locked: bool,
}

impl SpinLockGuard<'_> {
    /// Returns whether this guard actually holds the lock.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        if self.locked {
            self.lock.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_unlock() {
        let lock = SpinLock::new();
        assert!(!lock.is_locked());

        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());

        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_try_lock_for_times_out() {
        let lock = SpinLock::new();
        lock.lock();

        let start = Instant::now();
        assert!(!lock.try_lock_for(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));

        // Timeout left the lock untouched
        assert!(lock.is_locked());
        lock.unlock();
    }

    #[test]
    fn test_guard_releases_on_early_return() {
        fn early(lock: &SpinLock, value: Option<u32>) -> Option<u32> {
            let _guard = lock.guard();
            let value = value?;
            Some(value + 1)
        }

        let lock = SpinLock::new();
        assert!(early(&lock, None).is_none());
        assert!(!lock.is_locked());
        assert_eq!(early(&lock, Some(1)), Some(2));
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_guard_reports_failure() {
        let lock = SpinLock::new();
        let held = lock.guard();

        let attempt = lock.try_guard();
        assert!(!attempt.is_locked());
        drop(attempt);

        // Failed guard must not release someone else's lock
        assert!(lock.is_locked());
        drop(held);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_mutual_exclusion() {
        let lock = Arc::new(SpinLock::new());
        let inside = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        let _guard = lock.guard();
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        inside.store(false, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert!(!lock.is_locked());
    }
}
