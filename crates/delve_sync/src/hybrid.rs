//! # Hybrid Lock
//!
//! Spin first, park later.
//!
//! ```text
//!   acquire ──► CAS ok? ──yes──► held
//!                 │no
//!                 ▼
//!        contention += 1 ──► contention >= threshold? ──► blocking mode
//!                 │
//!       spin mode: bounded backoff, retry CAS
//!                 │ still contended
//!                 ▼
//!       park on condvar until unlock notifies (or deadline)
//! ```
//!
//! There is a single lock word in both modes, so switching modes while
//! the lock is held never breaks mutual exclusion. The mode only decides
//! how waiters wait.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};

/// Failed first attempts before a hybrid lock stops spinning.
pub const DEFAULT_CONTENTION_THRESHOLD: u32 = 64;

/// Upper bound on a single park, so a missed notification costs at most this.
const PARK_SLICE: Duration = Duration::from_millis(2);

/// Lock that spins under light contention and blocks under sustained
/// contention.
pub struct HybridLock {
    locked: AtomicBool,
    /// Acquisitions that did not succeed on the first try.
    contention: AtomicU32,
    threshold: u32,
    blocking: AtomicBool,
    waiters: AtomicUsize,
    park: Mutex<()>,
    unparked: Condvar,
}

impl HybridLock {
    /// Creates a hybrid lock with [`DEFAULT_CONTENTION_THRESHOLD`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_CONTENTION_THRESHOLD)
    }

    /// Creates a hybrid lock that switches to blocking after `threshold`
    /// contended acquisitions.
    #[must_use]
    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            locked: AtomicBool::new(false),
            contention: AtomicU32::new(0),
            threshold: threshold.max(1),
            blocking: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            park: Mutex::new(()),
            unparked: Condvar::new(),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Single non-blocking acquisition attempt.
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.locked.load(Ordering::Relaxed) && self.try_acquire()
    }

    /// Acquires the lock, blocking as long as needed.
    pub fn lock(&self) {
        let acquired = self.lock_until(None);
        debug_assert!(acquired);
    }

    /// Tries to acquire the lock until `timeout` elapses.
    ///
    /// Returns `false` without side effects on timeout.
    pub fn try_lock_for(&self, timeout: Duration) -> bool {
        self.lock_until(Some(Instant::now() + timeout))
    }

    fn lock_until(&self, deadline: Option<Instant>) -> bool {
        if self.try_lock() {
            return true;
        }
        self.record_contention();

        if !self.blocking.load(Ordering::Acquire) {
            let backoff = Backoff::new();
            while !backoff.is_completed() {
                backoff.snooze();
                if self.try_lock() {
                    return true;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return false;
                }
                if self.blocking.load(Ordering::Relaxed) {
                    break;
                }
            }
        }

        self.park_until(deadline)
    }

    fn park_until(&self, deadline: Option<Instant>) -> bool {
        let mut guard = self.park.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);

        let acquired = loop {
            if self.try_acquire() {
                break true;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break false;
                    }
                    (deadline - now).min(PARK_SLICE)
                }
                None => PARK_SLICE,
            };
            self.unparked.wait_for(&mut guard, slice);
        };

        self.waiters.fetch_sub(1, Ordering::SeqCst);
        acquired
    }

    fn record_contention(&self) {
        let seen = self.contention.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        if seen >= self.threshold && !self.blocking.swap(true, Ordering::AcqRel) {
            tracing::debug!(contention = seen, "hybrid lock switched to blocking mode");
        }
    }

    /// Releases the lock and wakes one parked waiter, if any.
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            let _park = self.park.lock();
            self.unparked.notify_one();
        }
    }

    /// Returns whether the lock is currently held.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Returns whether waiters currently park instead of spinning.
    #[inline]
    #[must_use]
    pub fn is_blocking_mode(&self) -> bool {
        self.blocking.load(Ordering::Relaxed)
    }

    /// Number of contended acquisitions since creation or the last reset.
    #[inline]
    #[must_use]
    pub fn contention_count(&self) -> u32 {
        self.contention.load(Ordering::Relaxed)
    }

    /// Clears the contention counter and returns to spin mode.
    pub fn reset(&self) {
        self.contention.store(0, Ordering::Relaxed);
        self.blocking.store(false, Ordering::Release);
    }

    /// Acquires the lock and returns a guard that releases it on drop.
    pub fn guard(&self) -> HybridLockGuard<'_> {
        self.lock();
        HybridLockGuard { lock: self, locked: true }
    }

    /// Bounded acquisition wrapped in a guard.
    pub fn guard_for(&self, timeout: Duration) -> HybridLockGuard<'_> {
        let locked = self.try_lock_for(timeout);
        HybridLockGuard { lock: self, locked }
    }
}

impl Default for HybridLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HybridLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridLock")
            .field("locked", &self.is_locked())
            .field("contention", &self.contention_count())
            .field("threshold", &self.threshold)
            .field("blocking", &self.is_blocking_mode())
            .finish()
    }
}

/// Scoped guard for a [`HybridLock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct HybridLockGuard<'a> {
    lock: &'a HybridLock,
    locked: bool,
}

impl HybridLockGuard<'_> {
    /// Returns whether this guard actually holds the lock.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for HybridLockGuard<'_> {
    fn drop(&mut self) {
        if self.locked {
            self.lock.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_uncontended_stays_in_spin_mode() {
        let lock = HybridLock::with_threshold(4);
        for _ in 0..100 {
            let guard = lock.guard();
            assert!(guard.is_locked());
        }
        assert_eq!(lock.contention_count(), 0);
        assert!(!lock.is_blocking_mode());
    }

    #[test]
    fn test_switches_to_blocking_after_threshold() {
        let lock = HybridLock::with_threshold(2);
        lock.lock();

        assert!(!lock.try_lock_for(Duration::from_millis(1)));
        assert!(!lock.is_blocking_mode());
        assert!(!lock.try_lock_for(Duration::from_millis(1)));
        assert!(lock.is_blocking_mode());
        assert_eq!(lock.contention_count(), 2);

        lock.unlock();
        lock.reset();
        assert!(!lock.is_blocking_mode());
        assert_eq!(lock.contention_count(), 0);
    }

    #[test]
    fn test_parked_waiter_is_woken() {
        let lock = Arc::new(HybridLock::with_threshold(1));
        lock.lock();

        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock();
                lock.unlock();
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(lock.is_blocking_mode());
        lock.unlock();
        waiter.join().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let lock = Arc::new(HybridLock::with_threshold(8));
        let counter = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let _guard = lock.guard();
                        // Non-atomic read-modify-write; only correct under exclusion
                        let value = counter.load(Ordering::Relaxed);
                        counter.store(value + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 16_000);
    }

    #[test]
    fn test_guard_for_timeout() {
        let lock = HybridLock::new();
        let _held = lock.guard();
        let attempt = lock.guard_for(Duration::from_millis(5));
        assert!(!attempt.is_locked());
    }
}
