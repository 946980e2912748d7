//! # Capability Tags
//!
//! A task may carry a capability tag describing what kind of worker it needs
//! (material evaluation, octree rebuilds, GPU dispatch, ...). Specialized
//! workers advertise the set they support. Routing is a bitmask subset test:
//!
//! ```text
//!   task tag:      0b0000_0101   (MATERIAL | OCTREE)
//!   worker set:    0b0000_0111   (MATERIAL | ZONE | OCTREE)
//!   tag ⊆ set  →   runnable
//! ```

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Set of worker capabilities, stored as a 32-bit mask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapabilitySet(u32);

/// Name table used by config parsing and `Display`.
const NAMED: [(&str, CapabilitySet); 8] = [
    ("material", CapabilitySet::MATERIAL),
    ("zone", CapabilitySet::ZONE),
    ("octree", CapabilitySet::OCTREE),
    ("field", CapabilitySet::FIELD),
    ("mesh", CapabilitySet::MESH),
    ("io", CapabilitySet::IO),
    ("gpu_dispatch", CapabilitySet::GPU_DISPATCH),
    ("validation", CapabilitySet::VALIDATION),
];

impl CapabilitySet {
    /// No capabilities.
    pub const EMPTY: Self = Self(0);
    /// Material property evaluation.
    pub const MATERIAL: Self = Self(1 << 0);
    /// Zone maintenance (splits, merges, ownership).
    pub const ZONE: Self = Self(1 << 1);
    /// Octree rebuilds and queries.
    pub const OCTREE: Self = Self(1 << 2);
    /// Scalar/vector field updates.
    pub const FIELD: Self = Self(1 << 3);
    /// Mesh extraction.
    pub const MESH: Self = Self(1 << 4);
    /// Disk and network I/O.
    pub const IO: Self = Self(1 << 5);
    /// Submitting GPU compute work.
    pub const GPU_DISPATCH: Self = Self(1 << 6);
    /// Consistency validation passes.
    pub const VALIDATION: Self = Self(1 << 7);

    /// Creates a set from raw bits. Unnamed bits are allowed for host-defined
    /// capabilities.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Union of both sets.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every capability in `other` is in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether every capability in `self` is in `other`.
    #[inline]
    #[must_use]
    pub const fn is_subset_of(self, other: Self) -> bool {
        other.contains(self)
    }

    /// Whether the set is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Looks up a single named capability (case-insensitive).
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        NAMED
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|&(_, caps)| caps)
    }

    /// Builds a set from names, returning the first unknown name on failure.
    ///
    /// # Errors
    ///
    /// Returns the offending name when it is not a known capability.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        names.iter().try_fold(Self::EMPTY, |acc, name| {
            Self::from_name(name.as_ref())
                .map(|caps| acc | caps)
                .ok_or_else(|| name.as_ref().to_string())
        })
    }
}

impl BitOr for CapabilitySet {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for CapabilitySet {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut rest = self.0;
        let mut first = true;
        for (name, caps) in NAMED {
            if self.contains(caps) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                rest &= !caps.0;
                first = false;
            }
        }
        if rest != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{rest:#x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilitySet({self})")
    }
}
