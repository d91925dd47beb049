//! Identifier types for the memory manager.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Memory context identifier - names one node of a context tree.
///
/// Identifiers are handed out by the owning tree and are never reused
/// within that tree, so a stale id of a destroyed context keeps failing
/// lookups instead of silently addressing a newer context.
///
/// # Example
///
/// ```rust
/// use nexus_common::types::ContextId;
///
/// let id = ContextId::new(7);
/// assert_eq!(id.as_u64(), 7);
/// assert!(id.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ContextId(u64);

impl ContextId {
    /// Invalid context ID, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// The first ID handed out by a tree (its root).
    pub const FIRST: Self = Self(1);

    /// Creates a new `ContextId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next context ID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Checks if this is a valid context ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "ContextId(INVALID)")
        } else {
            write!(f, "ContextId({})", self.0)
        }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ContextId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<ContextId> for u64 {
    #[inline]
    fn from(id: ContextId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_id() {
        let id = ContextId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert!(id.is_valid());
        assert!(!ContextId::INVALID.is_valid());

        assert_eq!(id.next().as_u64(), 43);
        assert_eq!(ContextId::FIRST.next(), ContextId::new(2));
    }

    #[test]
    fn test_context_id_formatting() {
        assert_eq!(format!("{:?}", ContextId::new(3)), "ContextId(3)");
        assert_eq!(format!("{:?}", ContextId::INVALID), "ContextId(INVALID)");
        assert_eq!(ContextId::new(9).to_string(), "9");
    }

    #[test]
    fn test_context_id_conversions() {
        let id: ContextId = 5u64.into();
        let raw: u64 = id.into();
        assert_eq!(raw, 5);
    }
}
