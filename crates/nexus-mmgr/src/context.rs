//! The memory context contract.
//!
//! A memory context is a scoped allocator: everything allocated from it is
//! reclaimed at once by `reset` or `destroy`. [`AllocSet`](crate::AllocSet)
//! is the standard implementation; the context tree only talks to the trait.

use std::fmt;
use std::ops::AddAssign;

use nexus_common::NexusResult;

use crate::chunk::ChunkPtr;

/// Concrete implementation behind a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// The size-classed arena.
    AllocSet,
    /// Any implementation supplied by the embedding code.
    Custom,
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocSet => f.write_str("AllocSet"),
            Self::Custom => f.write_str("Custom"),
        }
    }
}

/// Scoped allocator operations.
///
/// Allocating operations fail only when the backing allocator is exhausted
/// or when the caller passes a handle this context does not own. `check`
/// and `stats` never fail; their findings go to the diagnostic sink.
pub trait MemoryContext: Send {
    /// Returns the implementation kind.
    fn kind(&self) -> ContextKind;

    /// Returns the human readable name.
    fn name(&self) -> &str;

    /// Allocates `size` zeroed bytes.
    fn alloc(&mut self, size: usize) -> NexusResult<ChunkPtr>;

    /// Returns a chunk to the context.
    fn free(&mut self, ptr: ChunkPtr) -> NexusResult<()>;

    /// Resizes a chunk. The returned handle replaces `ptr`.
    fn realloc(&mut self, ptr: ChunkPtr, new_size: usize) -> NexusResult<ChunkPtr>;

    /// Returns the requested bytes of a chunk.
    fn data(&self, ptr: ChunkPtr) -> NexusResult<&[u8]>;

    /// Returns the requested bytes of a chunk, mutably.
    fn data_mut(&mut self, ptr: ChunkPtr) -> NexusResult<&mut [u8]>;

    /// Reclaims every allocation. The context stays usable.
    fn reset(&mut self);

    /// Reclaims every allocation and all retained storage.
    fn destroy(&mut self);

    /// Validates internal structures and returns the number of problems
    /// reported.
    fn check(&self) -> usize;

    /// Reports usage statistics.
    fn stats(&self) -> MemoryContextStats;
}

/// Usage statistics of one context, or a sum over several.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryContextStats {
    /// Context name.
    pub name: String,
    /// Number of blocks held.
    pub blocks: usize,
    /// Bytes obtained from the backing allocator.
    pub reserved_bytes: usize,
    /// Bytes usable for chunks (block data regions).
    pub total_bytes: usize,
    /// Bytes in block tails and on freelists.
    pub free_bytes: usize,
    /// Number of chunks on freelists.
    pub free_chunks: usize,
    /// `total_bytes - free_bytes`.
    pub used_bytes: usize,
}

impl MemoryContextStats {
    /// Creates empty statistics for a named context.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl AddAssign<&MemoryContextStats> for MemoryContextStats {
    fn add_assign(&mut self, rhs: &MemoryContextStats) {
        self.blocks += rhs.blocks;
        self.reserved_bytes += rhs.reserved_bytes;
        self.total_bytes += rhs.total_bytes;
        self.free_bytes += rhs.free_bytes;
        self.free_chunks += rhs.free_chunks;
        self.used_bytes += rhs.used_bytes;
    }
}

impl fmt::Display for MemoryContextStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} total in {} blocks; {} free ({} chunks); {} used",
            self.name,
            self.total_bytes,
            self.blocks,
            self.free_bytes,
            self.free_chunks,
            self.used_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_display() {
        let stats = MemoryContextStats {
            name: "QueryContext".to_string(),
            blocks: 3,
            reserved_bytes: 7168,
            total_bytes: 7072,
            free_bytes: 4000,
            free_chunks: 2,
            used_bytes: 3072,
        };
        assert_eq!(
            stats.to_string(),
            "QueryContext: 7072 total in 3 blocks; 4000 free (2 chunks); 3072 used"
        );
    }

    #[test]
    fn test_stats_sum() {
        let mut total = MemoryContextStats::named("Grand total");
        let one = MemoryContextStats {
            name: "a".to_string(),
            blocks: 1,
            reserved_bytes: 1024,
            total_bytes: 992,
            free_bytes: 500,
            free_chunks: 1,
            used_bytes: 492,
        };
        total += &one;
        total += &one;

        assert_eq!(total.name, "Grand total");
        assert_eq!(total.blocks, 2);
        assert_eq!(total.total_bytes, 1984);
        assert_eq!(total.used_bytes, 984);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ContextKind::AllocSet.to_string(), "AllocSet");
        assert_eq!(ContextKind::Custom.to_string(), "Custom");
    }
}
