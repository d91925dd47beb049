//! Size-class freelists.
//!
//! Class `k` holds free chunks of `1 << (k + ALLOC_MIN_BITS)` bytes, from
//! 16 bytes up to `ALLOC_CHUNK_LIMIT`. Chunks are pushed at the head and
//! taken first-fit.

use nexus_common::{ALLOC_CHUNK_LIMIT, ALLOC_MIN_BITS, ALLOC_NUM_FREELISTS};

use crate::chunk::{Chunk, ChunkLink};

/// Returns the smallest class whose capacity is at least `size`.
///
/// # Example
///
/// ```rust
/// use nexus_mmgr::{class_size, free_index};
///
/// assert_eq!(free_index(1), 0);
/// assert_eq!(free_index(16), 0);
/// assert_eq!(free_index(17), 1);
/// assert_eq!(class_size(free_index(8192)), 8192);
/// ```
#[inline]
#[must_use]
pub fn free_index(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let shifted = (size - 1) >> ALLOC_MIN_BITS;
    let index = (usize::BITS - shifted.leading_zeros()) as usize;
    debug_assert!(index < ALLOC_NUM_FREELISTS, "size {size} beyond class limit");
    index
}

/// Capacity of the chunks in class `index`.
#[inline]
#[must_use]
pub const fn class_size(index: usize) -> usize {
    1 << (index as u32 + ALLOC_MIN_BITS)
}

/// Largest class whose capacity does not exceed `size`, if any.
#[inline]
pub(crate) fn class_floor(size: usize) -> Option<usize> {
    if size < class_size(0) {
        return None;
    }
    let index = (usize::BITS - 1 - size.leading_zeros()) - ALLOC_MIN_BITS;
    Some((index as usize).min(ALLOC_NUM_FREELISTS - 1))
}

/// The heads of every class.
#[derive(Debug)]
pub(crate) struct FreeLists {
    heads: [Option<Chunk>; ALLOC_NUM_FREELISTS],
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeLists {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; ALLOC_NUM_FREELISTS],
        }
    }

    /// Poisons `chunk` and pushes it onto its class.
    pub(crate) fn push(&mut self, chunk: Chunk) {
        debug_assert!(chunk.size() <= ALLOC_CHUNK_LIMIT);
        let index = free_index(chunk.size());
        chunk.clobber();
        chunk.set_link(ChunkLink::Free(self.heads[index]));
        self.heads[index] = Some(chunk);
    }

    /// Unlinks the first chunk of `size`'s class that can hold `size` bytes.
    pub(crate) fn take(&mut self, size: usize) -> Option<Chunk> {
        let index = free_index(size);
        let mut prior: Option<Chunk> = None;
        let mut cursor = self.heads[index];

        while let Some(chunk) = cursor {
            if chunk.size() >= size {
                let next = chunk.next_free();
                match prior {
                    Some(prior) => prior.set_link(ChunkLink::Free(next)),
                    None => self.heads[index] = next,
                }
                return Some(chunk);
            }
            prior = Some(chunk);
            cursor = chunk.next_free();
        }

        None
    }

    /// Forgets every chunk. The chunks themselves go away with their blocks.
    pub(crate) fn clear(&mut self) {
        self.heads = [None; ALLOC_NUM_FREELISTS];
    }

    /// Walks one class.
    pub(crate) fn iter(&self, index: usize) -> FreeListIter {
        FreeListIter {
            next: self.heads[index],
        }
    }

    /// Number of chunks in one class.
    pub(crate) fn len(&self, index: usize) -> usize {
        self.iter(index).count()
    }

    /// Number of chunks in every class.
    pub(crate) fn total_chunks(&self) -> usize {
        (0..ALLOC_NUM_FREELISTS).map(|i| self.len(i)).sum()
    }

    /// Bytes held by free chunks, headers included.
    pub(crate) fn total_bytes(&self) -> usize {
        (0..ALLOC_NUM_FREELISTS)
            .flat_map(|i| self.iter(i))
            .map(Chunk::total_size)
            .sum()
    }
}

/// Iterator over one freelist.
pub(crate) struct FreeListIter {
    next: Option<Chunk>,
}

impl Iterator for FreeListIter {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let current = self.next?;
        self.next = current.next_free();
        Some(current)
    }
}
