//! # Zone Lock Manager
//!
//! One lock per spatial zone, plus an owner slot per zone.
//!
//! ```text
//!   zone id:   0      1      2      3     ...   N-1
//!            ┌────┐ ┌────┐ ┌────┐ ┌────┐      ┌────┐
//!   lock     │ ░░ │ │    │ │ ░░ │ │    │ ...  │    │
//!   owner    │ T3 │ │ -- │ │ T1 │ │ -- │      │ -- │
//!            └────┘ └────┘ └────┘ └────┘      └────┘
//! ```
//!
//! ## Deadlock Freedom
//!
//! Multi-zone requests are ALWAYS sorted ascending and de-duplicated before
//! acquisition, whatever order the caller passes. Two threads asking for
//! {1,2,3} and {3,2,1} both lock 1, then 2, then 3, so no cycle can form.
//! A batch that cannot complete within its timeout releases everything it
//! took (in reverse order) before reporting failure.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{SyncError, SyncResult};
use crate::hierarchy::DEFAULT_DEADLOCK_WARNING;
use crate::hybrid::HybridLock;

/// Identifier of a spatial zone.
pub type ZoneId = u32;

/// Owner slot value for an unowned zone.
const NO_OWNER: u64 = 0;

/// Returns a process-unique, non-zero token for the calling thread.
///
/// Tokens are what [`ZoneLockManager::get_zone_owner`] reports.
#[must_use]
pub fn current_thread_token() -> u64 {
    static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|token| *token)
}

struct ZoneSlot {
    lock: HybridLock,
    owner: AtomicU64,
    acquisitions: AtomicU64,
}

impl ZoneSlot {
    fn new() -> Self {
        Self {
            lock: HybridLock::new(),
            owner: AtomicU64::new(NO_OWNER),
            acquisitions: AtomicU64::new(0),
        }
    }
}

/// Snapshot of zone lock activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ZoneLockStats {
    /// Number of managed zones.
    pub zone_count: usize,
    /// Zones locked at the time of the snapshot.
    pub locked_zones: usize,
    /// Successful acquisitions since creation.
    pub total_acquisitions: u64,
    /// Acquisitions that had to wait.
    pub contended_acquisitions: u64,
}

/// Independently lockable spatial partitions `0..zone_count`.
pub struct ZoneLockManager {
    slots: Box<[ZoneSlot]>,
    contended: AtomicU64,
    slow_acquire_warning: Duration,
}

impl ZoneLockManager {
    /// Creates a manager for `zone_count` zones, all unowned.
    #[must_use]
    pub fn new(zone_count: usize) -> Self {
        let slots: Vec<ZoneSlot> = (0..zone_count).map(|_| ZoneSlot::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            contended: AtomicU64::new(0),
            slow_acquire_warning: DEFAULT_DEADLOCK_WARNING,
        }
    }

    /// Sets how long an untimed acquisition waits before a suspected
    /// deadlock is logged.
    #[must_use]
    pub fn with_slow_acquire_warning(mut self, threshold: Duration) -> Self {
        self.slow_acquire_warning = threshold;
        self
    }

    /// Number of managed zones.
    #[inline]
    #[must_use]
    pub fn zone_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, zone: ZoneId) -> SyncResult<&ZoneSlot> {
        self.slots
            .get(zone as usize)
            .ok_or(SyncError::ZoneOutOfRange {
                zone,
                zone_count: self.slots.len(),
            })
    }

    fn claim(slot: &ZoneSlot, owner: u64) {
        slot.owner.store(owner, Ordering::Release);
        slot.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    fn lock_watching(&self, slot: &ZoneSlot, zone: ZoneId) {
        if slot.lock.try_lock_for(self.slow_acquire_warning) {
            return;
        }
        tracing::warn!(
            zone,
            owner = slot.owner.load(Ordering::Relaxed),
            waited_ms = self.slow_acquire_warning.as_millis() as u64,
            "possible deadlock: zone lock wait exceeded threshold"
        );
        slot.lock.lock();
    }

    /// Acquires exclusive ownership of `zone`.
    ///
    /// `None` waits as long as needed.
    ///
    /// # Errors
    ///
    /// - [`SyncError::ZoneOutOfRange`] for an unknown zone
    /// - [`SyncError::ZoneReentry`] if the caller already owns it
    /// - [`SyncError::LockTimeout`] if `timeout` elapsed; nothing is held
    pub fn lock_zone(&self, zone: ZoneId, timeout: Option<Duration>) -> SyncResult<()> {
        let slot = self.slot(zone)?;
        let me = current_thread_token();
        if slot.owner.load(Ordering::Acquire) == me {
            return Err(SyncError::ZoneReentry(zone));
        }

        if !slot.lock.try_lock() {
            self.contended.fetch_add(1, Ordering::Relaxed);
            match timeout {
                Some(timeout) => {
                    let start = Instant::now();
                    if !slot.lock.try_lock_for(timeout) {
                        return Err(SyncError::LockTimeout {
                            resource: format!("zone {zone}"),
                            waited: start.elapsed(),
                        });
                    }
                }
                None => self.lock_watching(slot, zone),
            }
        }

        Self::claim(slot, me);
        Ok(())
    }

    /// Single non-blocking attempt. `Ok(false)` means the zone is busy.
    ///
    /// # Errors
    ///
    /// [`SyncError::ZoneOutOfRange`] or [`SyncError::ZoneReentry`].
    pub fn try_lock_zone(&self, zone: ZoneId) -> SyncResult<bool> {
        let slot = self.slot(zone)?;
        let me = current_thread_token();
        if slot.owner.load(Ordering::Acquire) == me {
            return Err(SyncError::ZoneReentry(zone));
        }
        if slot.lock.try_lock() {
            Self::claim(slot, me);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Releases `zone`.
    ///
    /// # Errors
    ///
    /// [`SyncError::ZoneOutOfRange`], or [`SyncError::NotZoneOwner`] if the
    /// calling thread does not own the zone.
    pub fn unlock_zone(&self, zone: ZoneId) -> SyncResult<()> {
        let slot = self.slot(zone)?;
        if slot.owner.load(Ordering::Acquire) != current_thread_token() {
            return Err(SyncError::NotZoneOwner(zone));
        }
        slot.owner.store(NO_OWNER, Ordering::Release);
        slot.lock.unlock();
        Ok(())
    }

    /// The order in which a multi-zone request acquires its zones:
    /// ascending, without duplicates.
    #[must_use]
    pub fn acquisition_order(zones: &[ZoneId]) -> Vec<ZoneId> {
        let mut ordered = zones.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        ordered
    }

    /// Acquires every zone in `zones`, in ascending order, sharing one
    /// deadline across the batch.
    ///
    /// Returns the zones in the order they were acquired.
    ///
    /// # Errors
    ///
    /// Any [`lock_zone`](Self::lock_zone) error. On error no zone from
    /// this call is held.
    pub fn lock_multiple_zones(
        &self,
        zones: &[ZoneId],
        timeout: Option<Duration>,
    ) -> SyncResult<Vec<ZoneId>> {
        let ordered = Self::acquisition_order(zones);

        // Fail fast before taking anything
        for &zone in &ordered {
            self.slot(zone)?;
            if self.is_owned_by_current_thread(zone) {
                return Err(SyncError::ZoneReentry(zone));
            }
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut acquired = Vec::with_capacity(ordered.len());
        for &zone in &ordered {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if let Err(err) = self.lock_zone(zone, remaining) {
                for &held in acquired.iter().rev() {
                    if let Err(unlock_err) = self.unlock_zone(held) {
                        tracing::error!(zone = held, error = %unlock_err, "zone rollback failed");
                    }
                }
                tracing::debug!(zone, taken = acquired.len(), "multi-zone lock rolled back");
                return Err(err);
            }
            acquired.push(zone);
        }
        Ok(acquired)
    }

    /// Releases every zone in `zones`, highest id first.
    ///
    /// Keeps releasing after an error and reports the first one.
    ///
    /// # Errors
    ///
    /// The first [`unlock_zone`](Self::unlock_zone) error encountered.
    pub fn unlock_multiple_zones(&self, zones: &[ZoneId]) -> SyncResult<()> {
        let mut first_error = None;
        for &zone in Self::acquisition_order(zones).iter().rev() {
            if let Err(err) = self.unlock_zone(zone) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Thread token of the zone's owner, if it is locked.
    #[must_use]
    pub fn get_zone_owner(&self, zone: ZoneId) -> Option<u64> {
        let owner = self.slot(zone).ok()?.owner.load(Ordering::Acquire);
        (owner != NO_OWNER).then_some(owner)
    }

    /// Whether the zone is currently locked by anyone.
    #[must_use]
    pub fn is_zone_locked(&self, zone: ZoneId) -> bool {
        self.slot(zone).is_ok_and(|slot| slot.lock.is_locked())
    }

    /// Whether the calling thread owns the zone.
    #[must_use]
    pub fn is_owned_by_current_thread(&self, zone: ZoneId) -> bool {
        self.get_zone_owner(zone) == Some(current_thread_token())
    }

    /// Successful acquisitions of one zone since creation.
    #[must_use]
    pub fn acquisition_count(&self, zone: ZoneId) -> u64 {
        self.slot(zone)
            .map_or(0, |slot| slot.acquisitions.load(Ordering::Relaxed))
    }

    /// Activity snapshot.
    #[must_use]
    pub fn stats(&self) -> ZoneLockStats {
        ZoneLockStats {
            zone_count: self.slots.len(),
            locked_zones: self.slots.iter().filter(|s| s.lock.is_locked()).count(),
            total_acquisitions: self
                .slots
                .iter()
                .map(|s| s.acquisitions.load(Ordering::Relaxed))
                .sum(),
            contended_acquisitions: self.contended.load(Ordering::Relaxed),
        }
    }

    /// Scoped single-zone ownership.
    ///
    /// # Errors
    ///
    /// See [`lock_zone`](Self::lock_zone).
    pub fn zone_guard(&self, zone: ZoneId, timeout: Option<Duration>) -> SyncResult<ZoneGuard<'_>> {
        self.lock_zone(zone, timeout)?;
        Ok(ZoneGuard {
            manager: self,
            zone,
            _owner_thread: PhantomData,
        })
    }

    /// Scoped multi-zone ownership.
    ///
    /// # Errors
    ///
    /// See [`lock_multiple_zones`](Self::lock_multiple_zones).
    pub fn multi_zone_guard(
        &self,
        zones: &[ZoneId],
        timeout: Option<Duration>,
    ) -> SyncResult<MultiZoneGuard<'_>> {
        let zones = self.lock_multiple_zones(zones, timeout)?;
        Ok(MultiZoneGuard {
            manager: self,
            zones,
            _owner_thread: PhantomData,
        })
    }
}

impl fmt::Debug for ZoneLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneLockManager")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Owns one zone until dropped.
///
/// Zone ownership belongs to the locking thread, so the guard is `!Send`.
#[must_use = "the zone is released as soon as the guard is dropped"]
pub struct ZoneGuard<'a> {
    manager: &'a ZoneLockManager,
    zone: ZoneId,
    // PhantomData<*const ()> is !Send: the guard must drop on its owner thread
    _owner_thread: PhantomData<*const ()>,
}

impl ZoneGuard<'_> {
    /// The owned zone.
    #[must_use]
    pub fn zone(&self) -> ZoneId {
        self.zone
    }
}

impl Drop for ZoneGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.manager.unlock_zone(self.zone) {
            tracing::error!(zone = self.zone, error = %err, "zone guard failed to release");
        }
    }
}

/// Owns a set of zones until dropped; releases highest id first.
///
/// `!Send` for the same reason as [`ZoneGuard`].
#[must_use = "the zones are released as soon as the guard is dropped"]
pub struct MultiZoneGuard<'a> {
    manager: &'a ZoneLockManager,
    zones: Vec<ZoneId>,
    _owner_thread: PhantomData<*const ()>,
}

impl MultiZoneGuard<'_> {
    /// Owned zones, in the order they were acquired.
    #[must_use]
    pub fn zones(&self) -> &[ZoneId] {
        &self.zones
    }
}

impl Drop for MultiZoneGuard<'_> {
    fn drop(&mut self) {
        for &zone in self.zones.iter().rev() {
            if let Err(err) = self.manager.unlock_zone(zone) {
                tracing::error!(zone, error = %err, "zone guard failed to release");
            }
        }
    }
}
