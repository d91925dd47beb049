//! Block layout and the arena's block list.
//!
//! A block is one region from the backing allocator. Its header records the
//! owning arena, the bump cursor and the link to the next block; chunks are
//! carved from the bytes that follow.
//!
//! ```text
//! ┌──────────────┬─────────┬─────────┬─────────┬──────────────────────┐
//! │ BlockHeader  │ chunk 0 │ chunk 1 │ chunk 2 │ free tail            │
//! └──────────────┴─────────┴─────────┴─────────┴──────────────────────┘
//!                                               ▲                      ▲
//!                                          free_offset               size
//! ```

use std::fmt;
use std::mem;
use std::ptr::NonNull;

use nexus_common::MAXIMUM_ALIGNOF;

use crate::backing::{max_align, RawRegion};
use crate::chunk::{ArenaId, Chunk, ChunkPtr, CHUNK_HDR_SZ};

#[repr(C)]
struct BlockHeader {
    owner: usize,
    size: usize,
    free_offset: usize,
    next: Option<NonNull<BlockHeader>>,
}

/// Size of a block header, rounded to the maximum alignment.
pub const BLOCK_HDR_SZ: usize = max_align(mem::size_of::<BlockHeader>());

/// A block header at the start of a live region.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block(NonNull<BlockHeader>);

impl Block {
    /// Writes an empty block header at the start of `region`.
    ///
    /// # Safety
    ///
    /// `region` must be freshly acquired, maximally aligned and at least
    /// `BLOCK_HDR_SZ` bytes long.
    pub(crate) unsafe fn init(region: RawRegion, owner: ArenaId) -> Self {
        debug_assert!(region.size() >= BLOCK_HDR_SZ);
        let header = region.ptr().cast::<BlockHeader>();
        // SAFETY: guaranteed by the caller
        unsafe {
            header.as_ptr().write(BlockHeader {
                owner: owner.as_usize(),
                size: region.size(),
                free_offset: BLOCK_HDR_SZ,
                next: None,
            });
        }
        Self(header)
    }

    /// Re-adopts a dedicated block after the backing allocator resized it.
    /// The whole region is marked as used.
    ///
    /// # Safety
    ///
    /// `region` must be the result of extending a region whose first bytes
    /// held a block header.
    pub(crate) unsafe fn adopt_resized(region: RawRegion) -> Self {
        let mut block = Self(region.ptr().cast());
        let header = block.header_mut();
        header.size = region.size();
        header.free_offset = region.size();
        header.next = None;
        block
    }

    #[inline]
    fn header(&self) -> &BlockHeader {
        // SAFETY: blocks are only constructed over live headers
        unsafe { self.0.as_ref() }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut BlockHeader {
        // SAFETY: blocks are only constructed over live headers, and the
        // arena holds no other reference into this header while mutating
        unsafe { self.0.as_mut() }
    }

    /// The whole region, for handing back to the backing allocator.
    #[inline]
    pub(crate) fn region(self) -> RawRegion {
        RawRegion::new(self.0.cast(), self.size())
    }

    /// Offset of the chunk header in front of `ptr`, if `ptr` lies in the
    /// carved part of this block where chunk data could start.
    ///
    /// Only addresses are compared; nothing behind `ptr` is read.
    pub(crate) fn header_offset(self, ptr: ChunkPtr) -> Option<usize> {
        let offset = ptr
            .addr()
            .checked_sub(self.0.as_ptr() as usize)?
            .checked_sub(CHUNK_HDR_SZ)?;
        let carved = offset >= BLOCK_HDR_SZ && offset + CHUNK_HDR_SZ < self.free_offset();
        (carved && offset % MAXIMUM_ALIGNOF == 0).then_some(offset)
    }

    #[inline]
    pub(crate) fn owner(self) -> ArenaId {
        ArenaId::from_raw(self.header().owner)
    }

    /// Size of the region including the header.
    #[inline]
    pub(crate) fn size(self) -> usize {
        self.header().size
    }

    /// Bytes available to chunks.
    #[inline]
    pub(crate) fn data_size(self) -> usize {
        self.size() - BLOCK_HDR_SZ
    }

    /// Offset of the first unused byte.
    #[inline]
    pub(crate) fn free_offset(self) -> usize {
        self.header().free_offset
    }

    /// Bytes left in the tail.
    #[inline]
    pub(crate) fn avail_space(self) -> usize {
        self.size() - self.free_offset()
    }

    #[inline]
    pub(crate) fn next(self) -> Option<Block> {
        self.header().next.map(Block)
    }

    #[inline]
    fn set_next(mut self, next: Option<Block>) {
        self.header_mut().next = next.map(|b| b.0);
    }

    /// Moves the cursor back to the start of the data region.
    pub(crate) fn rewind(mut self) {
        let header = self.header_mut();
        header.free_offset = BLOCK_HDR_SZ;
        header.next = None;
    }

    /// Bump-allocates a chunk of `chunk_size` capacity from the tail.
    pub(crate) fn carve(mut self, chunk_size: usize) -> Option<Chunk> {
        let required = CHUNK_HDR_SZ + chunk_size;
        if self.avail_space() < required {
            return None;
        }

        let offset = self.free_offset();
        // SAFETY: offset + required <= size, and offsets stay maximally
        // aligned because every chunk size is
        let chunk = unsafe {
            let at = NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(offset));
            Chunk::init(at, chunk_size)
        };
        self.header_mut().free_offset = offset + required;
        Some(chunk)
    }

    /// Chunk header at `offset` from the block start.
    ///
    /// # Safety
    ///
    /// `offset` must be the start of a chunk previously carved from this
    /// block and below `free_offset`.
    pub(crate) unsafe fn chunk_at(self, offset: usize) -> Chunk {
        // SAFETY: guaranteed by the caller
        unsafe { Chunk::at(NonNull::new_unchecked(self.0.as_ptr().cast::<u8>().add(offset))) }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("addr", &self.0)
            .field("size", &self.size())
            .field("free_offset", &self.free_offset())
            .finish()
    }
}

/// Singly linked list of an arena's blocks.
///
/// Not sorted. Insertion only looks at the head: a block with more free
/// space than the head replaces it, anything else goes second.
#[derive(Debug, Default)]
pub(crate) struct BlockList {
    head: Option<Block>,
    len: usize,
}

impl BlockList {
    pub(crate) const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[inline]
    pub(crate) fn head(&self) -> Option<Block> {
        self.head
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Inserts a block as head or right after it.
    pub(crate) fn enqueue(&mut self, block: Block) {
        match self.head {
            Some(head) if block.avail_space() <= head.avail_space() => {
                block.set_next(head.next());
                head.set_next(Some(block));
            }
            head => {
                block.set_next(head);
                self.head = Some(block);
            }
        }
        self.len += 1;
    }

    /// Unlinks `block`. Returns false if it is not in the list.
    pub(crate) fn remove(&mut self, block: Block) -> bool {
        let mut prev: Option<Block> = None;
        let mut cursor = self.head;

        while let Some(current) = cursor {
            if current == block {
                match prev {
                    Some(prev) => prev.set_next(current.next()),
                    None => self.head = current.next(),
                }
                current.set_next(None);
                self.len -= 1;
                return true;
            }
            prev = Some(current);
            cursor = current.next();
        }

        false
    }

    /// Detaches every block, returning them in list order.
    pub(crate) fn drain(&mut self) -> Vec<Block> {
        let blocks: Vec<Block> = self.iter().collect();
        self.head = None;
        self.len = 0;
        blocks
    }

    pub(crate) fn iter(&self) -> BlockIter {
        BlockIter { next: self.head }
    }
}

/// Iterator over a block list.
pub(crate) struct BlockIter {
    next: Option<Block>,
}

impl Iterator for BlockIter {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let current = self.next?;
        self.next = current.next();
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{BackingAllocator, SystemAllocator};

    fn block(system: &SystemAllocator, size: usize, owner: ArenaId) -> Block {
        let region = system.acquire(size).unwrap();
        unsafe { Block::init(region, owner) }
    }

    fn release(system: &SystemAllocator, blocks: impl IntoIterator<Item = Block>) {
        for b in blocks {
            unsafe { system.release(b.region()) };
        }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(BLOCK_HDR_SZ, 32);
    }

    #[test]
    fn test_carve() {
        let system = SystemAllocator::new();
        let owner = ArenaId::next();
        let b = block(&system, 1024, owner);

        assert_eq!(b.owner(), owner);
        assert_eq!(b.data_size(), 1024 - BLOCK_HDR_SZ);
        assert_eq!(b.avail_space(), 1024 - BLOCK_HDR_SZ);

        let chunk = b.carve(64).unwrap();
        assert_eq!(chunk.size(), 64);
        assert_eq!(chunk.addr() - b.region().as_ptr() as usize, BLOCK_HDR_SZ);
        assert_eq!(b.free_offset(), BLOCK_HDR_SZ + CHUNK_HDR_SZ + 64);
        assert_eq!(unsafe { b.chunk_at(BLOCK_HDR_SZ) }, chunk);

        // Does not fit
        assert!(b.carve(1024).is_none());

        b.rewind();
        assert_eq!(b.free_offset(), BLOCK_HDR_SZ);

        release(&system, [b]);
    }

    #[test]
    fn test_header_offset() {
        let system = SystemAllocator::new();
        let b = block(&system, 1024, ArenaId::next());
        let other = block(&system, 1024, ArenaId::next());

        let first = b.carve(64).unwrap();
        let second = b.carve(16).unwrap();
        assert_eq!(b.header_offset(first.data()), Some(BLOCK_HDR_SZ));
        assert_eq!(
            b.header_offset(second.data()),
            Some(BLOCK_HDR_SZ + CHUNK_HDR_SZ + 64)
        );
        assert_eq!(other.header_offset(first.data()), None);

        // Carved bytes are forgotten once the cursor moves back
        b.rewind();
        assert_eq!(b.header_offset(first.data()), None);

        release(&system, [b, other]);
    }

    #[test]
    fn test_dedicated_block() {
        let system = SystemAllocator::new();
        let b = block(&system, BLOCK_HDR_SZ + CHUNK_HDR_SZ + 9008, ArenaId::next());

        let chunk = b.carve(9008).unwrap();
        assert_eq!(b.avail_space(), 0);
        assert_eq!(b.header_offset(chunk.data()), Some(BLOCK_HDR_SZ));

        release(&system, [b]);
    }

    #[test]
    fn test_enqueue_heuristic() {
        let system = SystemAllocator::new();
        let owner = ArenaId::next();
        let mut list = BlockList::new();

        let small = block(&system, 1024, owner);
        let large = block(&system, 4096, owner);
        let medium = block(&system, 2048, owner);

        list.enqueue(small);
        list.enqueue(large);
        // Not bigger than the head: goes second
        list.enqueue(medium);

        let order: Vec<Block> = list.iter().collect();
        assert_eq!(order, vec![large, medium, small]);
        assert_eq!(list.len(), 3);

        release(&system, list.drain());
        assert_eq!(list.len(), 0);
        assert!(list.head().is_none());
    }

    #[test]
    fn test_remove() {
        let system = SystemAllocator::new();
        let owner = ArenaId::next();
        let mut list = BlockList::new();

        let a = block(&system, 4096, owner);
        let b = block(&system, 2048, owner);
        let c = block(&system, 1024, owner);
        list.enqueue(a);
        list.enqueue(b);
        list.enqueue(c);

        assert!(list.remove(c));
        assert!(list.iter().all(|b| b != c));
        assert!(!list.remove(c));
        assert!(list.remove(a));
        assert_eq!(list.head(), Some(b));
        assert_eq!(list.len(), 1);

        release(&system, [a, c]);
        release(&system, list.drain());
    }
}
