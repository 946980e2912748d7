//! # Sync Error Types
//!
//! All errors that can occur while acquiring or releasing locks.

use std::time::Duration;

use thiserror::Error;

use crate::hierarchy::LockLevel;
use crate::zone::ZoneId;

/// Errors that can occur in the synchronization layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Acquisition did not succeed within the allotted time.
    #[error("lock timeout on {resource} after {waited:?}")]
    LockTimeout {
        /// Human readable name of the lock.
        resource: String,
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// Zone id is outside the managed range.
    #[error("zone {zone} out of range (zone count {zone_count})")]
    ZoneOutOfRange {
        /// The requested zone.
        zone: ZoneId,
        /// Number of zones managed.
        zone_count: usize,
    },

    /// The calling thread already owns this zone.
    #[error("zone {0} is already owned by the calling thread")]
    ZoneReentry(ZoneId),

    /// The calling thread tried to release a zone it does not own.
    #[error("zone {0} is not owned by the calling thread")]
    NotZoneOwner(ZoneId),

    /// Strict acquisition refused an out-of-order lock level.
    #[error("lock hierarchy violation: requested {requested:?} while holding {highest_held:?}")]
    HierarchyViolation {
        /// Level the caller tried to acquire.
        requested: LockLevel,
        /// Highest level already held by the thread.
        highest_held: LockLevel,
    },
}

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;
