//! # Reader-Writer Lock
//!
//! N concurrent readers or one exclusive writer, with writer preference.
//!
//! ## Rules
//!
//! - A writer waits for all readers to leave, then runs alone.
//! - Once a writer is waiting, NEW readers are refused (try) or blocked.
//!   Readers already inside finish normally. This bounds writer starvation.
//! - `try_upgrade_to_write` converts the sole reader into the writer in
//!   place. With other readers present it fails immediately; it never waits,
//!   since two upgrading readers would otherwise wait on each other forever.
//! - `downgrade_to_read` always succeeds.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct RwState {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
}

impl RwState {
    #[inline]
    fn reader_may_enter(&self) -> bool {
        !self.writer && self.writers_waiting == 0
    }

    #[inline]
    fn writer_may_enter(&self) -> bool {
        !self.writer && self.readers == 0
    }
}

/// Writer-preferring reader-writer lock with timeouts and upgrades.
///
/// Like [`SpinLock`](crate::SpinLock) this is a raw lock: callers pair it
/// with the state it protects and use the guards for scoped access.
pub struct ReaderWriterLock {
    state: Mutex<RwState>,
    changed: Condvar,
}

impl ReaderWriterLock {
    /// Creates an unlocked reader-writer lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RwState::default()),
            changed: Condvar::new(),
        }
    }

    /// Acquires shared access.
    ///
    /// `None` waits forever. On timeout returns `false` and holds nothing.
    pub fn read_lock(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while !state.reader_may_enter() {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out()
                        && !state.reader_may_enter()
                    {
                        return false;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        state.readers += 1;
        true
    }

    /// Single non-blocking attempt at shared access.
    ///
    /// Fails while a writer holds the lock or is waiting for it.
    pub fn try_read_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.reader_may_enter() {
            state.readers += 1;
            true
        } else {
            false
        }
    }

    /// Acquires exclusive access.
    ///
    /// While waiting, the writer blocks new readers. On timeout the waiting
    /// mark is withdrawn, blocked readers are woken, and `false` is returned.
    pub fn write_lock(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        if state.writer_may_enter() {
            state.writer = true;
            return true;
        }

        state.writers_waiting += 1;
        while !state.writer_may_enter() {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out()
                        && !state.writer_may_enter()
                    {
                        state.writers_waiting -= 1;
                        drop(state);
                        self.changed.notify_all();
                        return false;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        state.writers_waiting -= 1;
        state.writer = true;
        true
    }

    /// Single non-blocking attempt at exclusive access.
    pub fn try_write_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.writer_may_enter() {
            state.writer = true;
            true
        } else {
            false
        }
    }

    /// Releases shared access.
    pub fn read_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "read_unlock without a reader");
        state.readers = state.readers.saturating_sub(1);
        let last_reader = state.readers == 0;
        drop(state);
        if last_reader {
            self.changed.notify_all();
        }
    }

    /// Releases exclusive access.
    pub fn write_unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer, "write_unlock without a writer");
        state.writer = false;
        drop(state);
        self.changed.notify_all();
    }

    /// Promotes the caller's read access to write access in place.
    ///
    /// Succeeds only when the caller is the sole reader and no writer holds
    /// the lock. On failure the caller still holds its read access.
    pub fn try_upgrade_to_write(&self) -> bool {
        let mut state = self.state.lock();
        if state.readers == 1 && !state.writer {
            state.readers = 0;
            state.writer = true;
            true
        } else {
            false
        }
    }

    /// Converts the caller's write access into read access.
    ///
    /// Other readers may enter afterwards unless a writer is waiting.
    pub fn downgrade_to_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer, "downgrade without a writer");
        state.writer = false;
        state.readers += 1;
        drop(state);
        self.changed.notify_all();
    }

    /// Number of readers currently inside.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    /// Whether a writer currently holds the lock.
    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }

    /// Number of writers waiting to enter.
    #[must_use]
    pub fn waiting_writers(&self) -> usize {
        self.state.lock().writers_waiting
    }

    /// Scoped shared access.
    pub fn read(&self, timeout: Option<Duration>) -> ReadGuard<'_> {
        let locked = self.read_lock(timeout);
        ReadGuard { lock: self, locked }
    }

    /// Scoped exclusive access.
    pub fn write(&self, timeout: Option<Duration>) -> WriteGuard<'_> {
        let locked = self.write_lock(timeout);
        WriteGuard { lock: self, locked }
    }
}

impl Default for ReaderWriterLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReaderWriterLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReaderWriterLock")
            .field("readers", &state.readers)
            .field("writer", &state.writer)
            .field("writers_waiting", &state.writers_waiting)
            .finish()
    }
}

/// Scoped shared access to a [`ReaderWriterLock`].
#[must_use = "read access is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a ReaderWriterLock,
    locked: bool,
}

impl<'a> ReadGuard<'a> {
    /// Returns whether read access was acquired.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Attempts an in-place upgrade to write access.
    ///
    /// On failure the original read guard is handed back unchanged.
    pub fn try_upgrade(self) -> Result<WriteGuard<'a>, Self> {
        if self.locked && self.lock.try_upgrade_to_write() {
            let lock = self.lock;
            std::mem::forget(self);
            Ok(WriteGuard { lock, locked: true })
        } else {
            Err(self)
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if self.locked {
            self.lock.read_unlock();
        }
    }
}

/// Scoped exclusive access to a [`ReaderWriterLock`].
#[must_use = "write access is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a ReaderWriterLock,
    locked: bool,
}

impl<'a> WriteGuard<'a> {
    /// Returns whether write access was acquired.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Converts this guard into read access without releasing the lock.
    pub fn downgrade(self) -> ReadGuard<'a> {
        let lock = self.lock;
        let locked = self.locked;
        std::mem::forget(self);
        if locked {
            lock.downgrade_to_read();
        }
        ReadGuard { lock, locked }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.locked {
            self.lock.write_unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicIsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_multiple_readers() {
        let lock = ReaderWriterLock::new();
        let r1 = lock.read(None);
        let r2 = lock.read(Some(Duration::from_millis(10)));
        assert!(r1.is_locked() && r2.is_locked());
        assert_eq!(lock.reader_count(), 2);

        assert!(!lock.try_write_lock());
        drop(r1);
        drop(r2);
        assert!(lock.try_write_lock());
        lock.write_unlock();
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let lock = Arc::new(ReaderWriterLock::new());
        assert!(lock.read_lock(None));
        assert!(lock.read_lock(None));

        let writer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let guard = lock.write(Some(Duration::from_secs(5)));
                assert!(guard.is_locked());
            })
        };

        while lock.waiting_writers() == 0 {
            thread::yield_now();
        }

        // Third reader is refused while the writer waits
        assert!(!lock.try_read_lock());
        assert!(!lock.read_lock(Some(Duration::from_millis(10))));

        lock.read_unlock();
        lock.read_unlock();
        writer.join().unwrap();

        assert!(lock.try_read_lock());
        lock.read_unlock();
    }

    #[test]
    fn test_writer_timeout_releases_waiting_mark() {
        let lock = ReaderWriterLock::new();
        assert!(lock.read_lock(None));

        assert!(!lock.write_lock(Some(Duration::from_millis(10))));
        assert_eq!(lock.waiting_writers(), 0);
        assert!(!lock.is_write_locked());

        // Readers are admitted again
        assert!(lock.try_read_lock());
        lock.read_unlock();
        lock.read_unlock();
    }

    #[test]
    fn test_upgrade_only_for_sole_reader() {
        let lock = ReaderWriterLock::new();
        let first = lock.read(None);
        let second = lock.read(None);

        let first = match first.try_upgrade() {
            Ok(_) => panic!("upgrade must fail with two readers"),
            Err(guard) => guard,
        };
        assert_eq!(lock.reader_count(), 2);

        drop(second);
        let writer = first.try_upgrade().ok().expect("sole reader upgrades");
        assert!(lock.is_write_locked());
        assert_eq!(lock.reader_count(), 0);

        let reader = writer.downgrade();
        assert!(reader.is_locked());
        assert!(!lock.is_write_locked());
        assert_eq!(lock.reader_count(), 1);
        drop(reader);
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_writer_never_overlaps_readers() {
        let lock = Arc::new(ReaderWriterLock::new());
        // Positive: readers inside. -1: writer inside.
        let occupancy = Arc::new(AtomicIsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let occupancy = Arc::clone(&occupancy);
                thread::spawn(move || {
                    for _ in 0..300 {
                        if i % 3 == 0 {
                            let guard = lock.write(None);
                            assert!(guard.is_locked());
                            assert_eq!(occupancy.swap(-1, Ordering::SeqCst), 0);
                            occupancy.store(0, Ordering::SeqCst);
                        } else {
                            let guard = lock.read(None);
                            assert!(guard.is_locked());
                            assert!(occupancy.fetch_add(1, Ordering::SeqCst) >= 0);
                            occupancy.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(occupancy.load(Ordering::SeqCst), 0);
    }
}
