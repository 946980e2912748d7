//! # DELVE Sync
//!
//! Synchronization substrate for the mining simulation. Registries, zone
//! managers and compute dispatch all share state through these primitives.
//!
//! ## Layers
//!
//! ```text
//!   ┌──────────────────────┐  ┌──────────────────────────┐
//!   │  ZoneLockManager     │  │  HierarchicalMutex<T>    │
//!   │  (ordered multi-lock)│  │  (level-validated)       │
//!   └──────────┬───────────┘  └────────────┬─────────────┘
//!              │                           │ thread-local history
//!   ┌──────────▼───────────────────────────▼─────────────┐
//!   │ SpinLock · HybridLock · ReaderWriterLock           │
//!   │ WaitFreeCounter · VersionedTable                   │
//!   └────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rules
//!
//! 1. **Every acquisition is scoped** - guards release on every exit path
//! 2. **Zones lock in ascending id order** - enforced, not advised
//! 3. **Lock categories follow [`LockLevel`] order** - violations are logged
//! 4. **Timeouts never leave partial state** - failure means nothing is held

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod error;
pub mod hierarchy;
pub mod hybrid;
pub mod rwlock;
pub mod spin;
pub mod waitfree;
pub mod zone;

pub use error::{SyncError, SyncResult};
pub use hierarchy::{
    add_to_history, can_safely_acquire, clear_history, held_levels, highest_held_level,
    remove_from_history, HierarchicalMutex, HierarchicalMutexGuard, LockLevel,
    DEFAULT_DEADLOCK_WARNING,
};
pub use hybrid::{HybridLock, HybridLockGuard, DEFAULT_CONTENTION_THRESHOLD};
pub use rwlock::{ReadGuard, ReaderWriterLock, WriteGuard};
pub use spin::{SpinLock, SpinLockGuard};
pub use waitfree::{VersionedTable, WaitFreeCounter};
pub use zone::{
    current_thread_token, MultiZoneGuard, ZoneGuard, ZoneId, ZoneLockManager, ZoneLockStats,
};
