//! The size-classed arena.
//!
//! An `AllocSet` bump-allocates power-of-two chunks out of blocks obtained
//! from a [`BackingAllocator`], recycles freed chunks through per-class
//! freelists, and gives every request above `ALLOC_CHUNK_LIMIT` a block of
//! its own. Nothing is returned to the backing allocator on `free` except
//! those dedicated blocks; everything else goes back at `reset`/`destroy`.
//!
//! ## Debugging aids
//!
//! - Every chunk whose capacity exceeds its requested size carries a
//!   `CHUNK_MAGIC` byte just past the requested bytes.
//! - Freed chunks are overwritten with `CHUNK_DIRTY`.
//! - [`AllocSet::check`] walks every block and reports broken markers,
//!   corrupt links and writes to freed chunks as notices.
//!
//! ## Handles
//!
//! Every allocation gets a process-unique stamp, recorded in the chunk
//! header and in the returned [`ChunkPtr`]. Before touching a header, the
//! arena checks that the handle points into the carved part of one of its
//! live blocks; it then accepts the handle only if the header still carries
//! the same stamp. Handles from another arena, from before a reset, or to a
//! released block are rejected without reading memory the arena no longer
//! owns.

use std::fmt;
use std::sync::Arc;

use nexus_common::config::AllocSetConfig;
use nexus_common::{
    NexusError, NexusResult, ALLOC_CHUNK_LIMIT, ALLOC_MIN_BLOCK_SIZE, ALLOC_NUM_FREELISTS,
    MAXIMUM_ALIGNOF,
};
use tracing::{debug, trace};

use crate::backing::{checked_max_align, system_backing, BackingAllocator};
use crate::block::{Block, BlockList, BLOCK_HDR_SZ};
use crate::chunk::{ArenaId, Chunk, ChunkLink, ChunkPtr, Stamp, CHUNK_HDR_SZ};
use crate::context::{ContextKind, MemoryContext, MemoryContextStats};
use crate::diag::{DiagnosticSink, Severity, TracingSink};
use crate::freelist::{class_floor, class_size, free_index, FreeLists};

/// Size-classed arena allocator.
///
/// # Example
///
/// ```rust
/// use nexus_common::config::AllocSetConfig;
/// use nexus_mmgr::AllocSet;
///
/// let mut set = AllocSet::new("example", &AllocSetConfig::small()).unwrap();
/// let ptr = set.alloc(40).unwrap();
/// set.data_mut(ptr).unwrap().copy_from_slice(&[7u8; 40]);
/// assert_eq!(set.data(ptr).unwrap()[0], 7);
///
/// set.reset();
/// assert_eq!(set.free_chunk_count(), 0);
/// ```
pub struct AllocSet {
    id: ArenaId,
    name: String,
    blocks: BlockList,
    /// Block allocated at construction and kept across resets.
    keeper: Option<Block>,
    freelists: FreeLists,
    init_block_size: usize,
    max_block_size: usize,
    /// Size of the next regular block.
    next_block_size: usize,
    backing: Arc<dyn BackingAllocator>,
    sink: Arc<dyn DiagnosticSink>,
    destroyed: bool,
}

// SAFETY: the arena exclusively owns every block it points to, and its
// collaborators are Send + Sync.
unsafe impl Send for AllocSet {}

impl AllocSet {
    /// Creates an arena over the system allocator that logs through `tracing`.
    pub fn new(name: impl Into<String>, config: &AllocSetConfig) -> NexusResult<Self> {
        Self::with_parts(name, config, system_backing(), Arc::new(TracingSink))
    }

    /// Creates an arena with explicit collaborators.
    ///
    /// Block sizes are clamped: the initial size is at least
    /// `ALLOC_MIN_BLOCK_SIZE` and the maximum is at least the initial size.
    /// A keeper block is allocated when `min_context_size` leaves room for
    /// at least one chunk header.
    pub fn with_parts(
        name: impl Into<String>,
        config: &AllocSetConfig,
        backing: Arc<dyn BackingAllocator>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> NexusResult<Self> {
        let aligned = |value: usize, field: &str| {
            checked_max_align(value).ok_or_else(|| {
                NexusError::invalid_config(format!("{field} of {value} bytes is too large"))
            })
        };
        let init_block_size =
            aligned(config.init_block_size, "init_block_size")?.max(ALLOC_MIN_BLOCK_SIZE);
        let max_block_size = aligned(config.max_block_size, "max_block_size")?.max(init_block_size);
        let min_context_size = aligned(config.min_context_size, "min_context_size")?;

        let mut set = Self {
            id: ArenaId::next(),
            name: name.into(),
            blocks: BlockList::new(),
            keeper: None,
            freelists: FreeLists::new(),
            init_block_size,
            max_block_size,
            next_block_size: init_block_size,
            backing,
            sink,
            destroyed: false,
        };

        if min_context_size > BLOCK_HDR_SZ + CHUNK_HDR_SZ {
            let size = min_context_size;
            let region = set
                .backing
                .acquire(size)
                .ok_or_else(|| set.out_of_memory(size))?;
            // SAFETY: region was just acquired and holds at least one header
            let keeper = unsafe { Block::init(region, set.id) };
            set.blocks.enqueue(keeper);
            set.keeper = Some(keeper);
        }

        debug!(
            "Created memory context \"{}\" (init {}, max {}, keeper {:?})",
            set.name,
            init_block_size,
            max_block_size,
            set.keeper.map(Block::size)
        );

        Ok(set)
    }

    /// Returns the context name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocates `size` zeroed bytes.
    ///
    /// Requests up to `ALLOC_CHUNK_LIMIT` are rounded up to their size class;
    /// larger ones get a dedicated block. Fails only when the backing
    /// allocator is exhausted.
    pub fn alloc(&mut self, size: usize) -> NexusResult<ChunkPtr> {
        self.ensure_live()?;

        let chunk = if size > ALLOC_CHUNK_LIMIT {
            self.alloc_large(size)?
        } else {
            match self.freelists.take(size) {
                Some(chunk) => chunk,
                None => self.alloc_from_block(class_size(free_index(size)), size)?,
            }
        };

        chunk.prepare(Stamp::issue(), size);
        Ok(chunk.data())
    }

    fn alloc_large(&mut self, size: usize) -> NexusResult<Chunk> {
        let (chunk_size, blk_size) =
            dedicated_block_size(size).ok_or_else(|| self.out_of_memory(size))?;

        let region = self
            .backing
            .acquire(blk_size)
            .ok_or_else(|| self.out_of_memory(size))?;
        // SAFETY: region was just acquired and fits the header and chunk
        let block = unsafe { Block::init(region, self.id) };

        let Some(chunk) = block.carve(chunk_size) else {
            // SAFETY: the block was never published
            unsafe { self.backing.release(block.region()) };
            return Err(NexusError::internal("dedicated block too small for its chunk"));
        };

        // Enqueued full, so it never displaces a head that still has room
        self.blocks.enqueue(block);

        trace!("\"{}\": dedicated block of {} bytes for {}", self.name, blk_size, size);
        Ok(chunk)
    }

    fn alloc_from_block(&mut self, chunk_size: usize, size: usize) -> NexusResult<Chunk> {
        if let Some(head) = self.blocks.head() {
            if let Some(chunk) = head.carve(chunk_size) {
                return Ok(chunk);
            }
            self.merge_block_remainder(head);
        }

        let required = BLOCK_HDR_SZ + CHUNK_HDR_SZ + chunk_size;
        let blk_size = self.next_block_size.max(required);

        let region = self
            .backing
            .acquire(blk_size)
            .ok_or_else(|| self.out_of_memory(size))?;
        // SAFETY: region was just acquired and is at least `required` bytes
        let block = unsafe { Block::init(region, self.id) };

        let Some(chunk) = block.carve(chunk_size) else {
            // SAFETY: the block was never published
            unsafe { self.backing.release(block.region()) };
            return Err(NexusError::internal("new block too small for its chunk"));
        };

        self.blocks.enqueue(block);
        self.next_block_size = self.next_block_size.saturating_mul(2).min(self.max_block_size);

        trace!("\"{}\": new block of {} bytes", self.name, blk_size);
        Ok(chunk)
    }

    /// Carves the unused tail of a retiring block into freelist chunks.
    fn merge_block_remainder(&mut self, block: Block) {
        while block.avail_space() >= class_size(0) + CHUNK_HDR_SZ {
            let Some(index) = class_floor(block.avail_space() - CHUNK_HDR_SZ) else {
                break;
            };
            let Some(chunk) = block.carve(class_size(index)) else {
                break;
            };
            self.freelists.push(chunk);
        }
    }

    /// Returns a chunk to the arena.
    ///
    /// Dedicated blocks go straight back to the backing allocator; every
    /// other chunk is poisoned and pushed onto its freelist. A broken
    /// boundary marker is reported as a notice but does not stop the free.
    pub fn free(&mut self, ptr: ChunkPtr) -> NexusResult<()> {
        self.ensure_live()?;
        let (block, chunk) = self.owned_chunk(ptr)?;

        if chunk.size() > ALLOC_CHUNK_LIMIT {
            return self.release_dedicated(block, chunk);
        }

        if !chunk.boundary_intact() {
            self.notice(&format!(
                "{}: detected write past chunk end in chunk {:p}",
                self.name, ptr
            ));
        }

        self.freelists.push(chunk);
        Ok(())
    }

    fn release_dedicated(&mut self, block: Block, chunk: Chunk) -> NexusResult<()> {
        self.unlink_dedicated(block, chunk)?;

        let size = block.size();
        // SAFETY: the block came from this backing allocator and is unlinked
        unsafe { self.backing.release(block.region()) };

        trace!("\"{}\": released dedicated block of {} bytes", self.name, size);
        Ok(())
    }

    /// Resizes a chunk.
    ///
    /// Shrinking, or growing within the current capacity, happens in place.
    /// A dedicated block is extended through the backing allocator. Anything
    /// else moves the data to a new chunk and frees the old one. Newly
    /// exposed bytes are zero.
    pub fn realloc(&mut self, ptr: ChunkPtr, new_size: usize) -> NexusResult<ChunkPtr> {
        self.ensure_live()?;
        let (block, chunk) = self.owned_chunk(ptr)?;

        if !chunk.boundary_intact() {
            return Err(NexusError::corruption(
                &self.name,
                format!("detected write past chunk end in chunk {ptr:p}"),
            ));
        }

        if chunk.size() >= new_size {
            chunk.resize_in_place(new_size);
            return Ok(ptr);
        }

        if chunk.size() > ALLOC_CHUNK_LIMIT {
            return self.grow_dedicated(block, chunk, new_size);
        }

        // Allocate before freeing: the old bytes must survive until copied,
        // and a failed allocation leaves the old chunk untouched.
        let new_ptr = self.alloc(new_size)?;
        // SAFETY: new_ptr was just handed out by this arena
        let new_chunk = unsafe { Chunk::from_data(new_ptr) };
        let len = chunk.requested_size().min(new_size);
        // SAFETY: both chunks are live and distinct; len fits both
        unsafe { chunk.copy_to(new_chunk, len) };

        self.freelists.push(chunk);
        Ok(new_ptr)
    }

    fn grow_dedicated(
        &mut self,
        block: Block,
        chunk: Chunk,
        new_size: usize,
    ) -> NexusResult<ChunkPtr> {
        let (chunk_size, blk_size) =
            dedicated_block_size(new_size).ok_or_else(|| self.out_of_memory(new_size))?;
        self.unlink_dedicated(block, chunk)?;

        // SAFETY: the block came from this backing allocator and is unlinked
        let Some(region) = (unsafe { self.backing.extend(block.region(), blk_size) }) else {
            self.blocks.enqueue(block);
            return Err(self.out_of_memory(new_size));
        };

        // SAFETY: the extended region starts with the old block header, and
        // the chunk header follows it
        let chunk = unsafe {
            let block = Block::adopt_resized(region);
            self.blocks.enqueue(block);
            block.chunk_at(BLOCK_HDR_SZ)
        };
        chunk.set_size(chunk_size);
        chunk.resize_in_place(new_size);

        trace!("\"{}\": grew dedicated block to {} bytes", self.name, blk_size);
        Ok(chunk.data())
    }

    /// Returns the requested bytes of a chunk.
    pub fn data(&self, ptr: ChunkPtr) -> NexusResult<&[u8]> {
        self.ensure_live()?;
        let (_, chunk) = self.owned_chunk(ptr)?;
        // SAFETY: the chunk is allocated by this arena and the slice borrows it
        Ok(unsafe { chunk.bytes() })
    }

    /// Returns the requested bytes of a chunk, mutably.
    pub fn data_mut(&mut self, ptr: ChunkPtr) -> NexusResult<&mut [u8]> {
        self.ensure_live()?;
        let (_, chunk) = self.owned_chunk(ptr)?;
        // SAFETY: the chunk is allocated by this arena and the slice borrows
        // the arena mutably
        Ok(unsafe { chunk.bytes_mut() })
    }

    /// Releases every block except the keeper, empties the freelists and
    /// rewinds the keeper. Every handle handed out so far becomes invalid
    /// and is rejected if used again.
    pub fn reset(&mut self) {
        if self.destroyed {
            return;
        }

        self.freelists.clear();

        let mut released = 0;
        for block in self.blocks.drain() {
            if Some(block) == self.keeper {
                block.rewind();
            } else {
                // SAFETY: the block came from this backing allocator and the
                // list no longer references it
                unsafe { self.backing.release(block.region()) };
                released += 1;
            }
        }

        if let Some(keeper) = self.keeper {
            self.blocks.enqueue(keeper);
        }
        self.next_block_size = self.init_block_size;

        if released > 0 {
            debug!("Reset memory context \"{}\", released {} blocks", self.name, released);
        }
    }

    /// Resets the arena and releases the keeper. Later operations fail with
    /// `ContextDestroyed`; calling `destroy` again does nothing.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }

        self.reset();
        if let Some(keeper) = self.keeper.take() {
            self.blocks.remove(keeper);
            // SAFETY: the keeper came from this backing allocator and is unlinked
            unsafe { self.backing.release(keeper.region()) };
        }
        self.destroyed = true;

        debug!("Destroyed memory context \"{}\"", self.name);
    }

    /// Walks every block and chunk and reports inconsistencies to the sink.
    ///
    /// Returns the number of notices emitted. Never allocates from the arena
    /// and never fails.
    pub fn check(&self) -> usize {
        if self.destroyed {
            return 0;
        }

        let mut problems = 0;
        for block in self.blocks.iter() {
            problems += self.check_block(block);
        }
        problems
    }

    fn check_block(&self, block: Block) -> usize {
        let mut problems = 0;
        let mut report = |message: String| {
            self.notice(&message);
            problems += 1;
        };

        if block.owner() != self.id {
            report(format!("{}: block {:?} has wrong owner", self.name, block));
        }

        let end = block.free_offset();
        if end < BLOCK_HDR_SZ || end > block.size() {
            report(format!("{}: corrupt header in block {:?}", self.name, block));
            return problems;
        }

        let mut offset = BLOCK_HDR_SZ;
        while offset < end {
            if end - offset < CHUNK_HDR_SZ {
                report(format!(
                    "{}: partial chunk header at offset {} in block {:?}",
                    self.name, offset, block
                ));
                break;
            }

            // SAFETY: offset lies below free_offset and past every chunk
            // walked so far
            let chunk = unsafe { block.chunk_at(offset) };
            let size = chunk.size();
            let requested = chunk.requested_size();

            if size < class_size(0) || size % MAXIMUM_ALIGNOF != 0 {
                report(format!(
                    "{}: bad chunk size {} for chunk {:?} in block {:?}",
                    self.name, size, chunk, block
                ));
                break;
            }
            if size > end - offset - CHUNK_HDR_SZ {
                report(format!(
                    "{}: chunk {:?} extends past end of block {:?}",
                    self.name, chunk, block
                ));
                break;
            }
            if size > ALLOC_CHUNK_LIMIT && (offset != BLOCK_HDR_SZ || end != block.size()) {
                report(format!(
                    "{}: bad single-chunk {:?} in block {:?}",
                    self.name, chunk, block
                ));
            }

            if requested > size {
                report(format!(
                    "{}: requested size {} exceeds capacity for chunk {:?} in block {:?}",
                    self.name, requested, chunk, block
                ));
            } else {
                match chunk.link() {
                    None => report(format!(
                        "{}: bogus link in chunk {:?} in block {:?}",
                        self.name, chunk, block
                    )),
                    Some(ChunkLink::Allocated(stamp))
                        if stamp == Stamp::NONE || stamp >= Stamp::horizon() =>
                    {
                        report(format!(
                            "{}: bogus stamp in chunk {:?} in block {:?}",
                            self.name, chunk, block
                        ))
                    }
                    Some(ChunkLink::Allocated(_)) => {
                        if !chunk.boundary_intact() {
                            report(format!(
                                "{}: detected write past chunk end in chunk {:?} in block {:?}",
                                self.name, chunk, block
                            ));
                        }
                    }
                    Some(ChunkLink::Free(_)) => {
                        if size > ALLOC_CHUNK_LIMIT || requested != 0 {
                            report(format!(
                                "{}: bogus free chunk {:?} in block {:?}",
                                self.name, chunk, block
                            ));
                        } else if !chunk.boundary_intact() || !chunk.poison_intact() {
                            report(format!(
                                "{}: detected write to freed chunk {:?} in block {:?}",
                                self.name, chunk, block
                            ));
                        }
                    }
                }
            }

            offset += CHUNK_HDR_SZ + size;
        }

        problems
    }

    /// Computes usage statistics and emits them to the sink.
    pub fn stats(&self) -> MemoryContextStats {
        let stats = self.usage();
        self.sink.emit(Severity::Log, &stats.to_string());
        stats
    }

    /// Computes usage statistics without emitting them.
    #[must_use]
    pub fn usage(&self) -> MemoryContextStats {
        let mut stats = MemoryContextStats::named(&self.name);
        for block in self.blocks.iter() {
            stats.blocks += 1;
            stats.reserved_bytes += block.size();
            stats.total_bytes += block.data_size();
            stats.free_bytes += block.avail_space();
        }
        stats.free_chunks = self.freelists.total_chunks();
        stats.free_bytes += self.freelists.total_bytes();
        stats.used_bytes = stats.total_bytes - stats.free_bytes;
        stats
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Number of blocks held, keeper included.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Region sizes of the blocks in list order.
    #[must_use]
    pub fn block_sizes(&self) -> Vec<usize> {
        self.blocks.iter().map(Block::size).collect()
    }

    /// Number of chunks on freelist `class`.
    #[must_use]
    pub fn freelist_len(&self, class: usize) -> usize {
        if class >= ALLOC_NUM_FREELISTS {
            return 0;
        }
        self.freelists.len(class)
    }

    /// Number of chunks on every freelist.
    #[must_use]
    pub fn free_chunk_count(&self) -> usize {
        self.freelists.total_chunks()
    }

    /// Capacity of an allocated chunk.
    pub fn chunk_capacity(&self, ptr: ChunkPtr) -> NexusResult<usize> {
        self.ensure_live()?;
        Ok(self.owned_chunk(ptr)?.1.size())
    }

    /// Size the caller asked for when allocating or last resizing a chunk.
    pub fn requested_size(&self, ptr: ChunkPtr) -> NexusResult<usize> {
        self.ensure_live()?;
        Ok(self.owned_chunk(ptr)?.1.requested_size())
    }

    /// Returns true if the arena retains a keeper block.
    #[must_use]
    pub fn has_keeper(&self) -> bool {
        self.keeper.is_some()
    }

    /// Returns true once `destroy` has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Effective initial block size after clamping.
    #[must_use]
    pub fn init_block_size(&self) -> usize {
        self.init_block_size
    }

    /// Effective block size cap after clamping.
    #[must_use]
    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// Size the next regular block will have.
    #[must_use]
    pub fn next_block_size(&self) -> usize {
        self.next_block_size
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn ensure_live(&self) -> NexusResult<()> {
        if self.destroyed {
            return Err(NexusError::ContextDestroyed {
                context: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Recovers the header of `ptr` and verifies this arena handed it out.
    fn owned_chunk(&self, ptr: ChunkPtr) -> NexusResult<(Block, Chunk)> {
        let not_owned = || NexusError::ChunkNotOwned {
            context: self.name.clone(),
        };
        let (block, offset) = self
            .blocks
            .iter()
            .find_map(|block| block.header_offset(ptr).map(|offset| (block, offset)))
            .ok_or_else(not_owned)?;

        // SAFETY: the header lies inside the carved part of a live block
        let chunk = unsafe { Chunk::from_data(ptr) };
        match chunk.link() {
            Some(ChunkLink::Allocated(stamp)) if stamp == ptr.stamp() => {}
            Some(ChunkLink::Allocated(_)) => return Err(not_owned()),
            Some(ChunkLink::Free(_)) => {
                return Err(NexusError::DoubleFree {
                    context: self.name.clone(),
                })
            }
            None => {
                return Err(NexusError::corruption(
                    &self.name,
                    format!("bogus link in chunk header of {ptr:p}"),
                ))
            }
        }

        let fits = chunk
            .size()
            .checked_add(offset + CHUNK_HDR_SZ)
            .is_some_and(|end| end <= block.free_offset());
        if !fits {
            return Err(NexusError::corruption(
                &self.name,
                format!("chunk {chunk:?} extends past end of block {block:?}"),
            ));
        }
        Ok((block, chunk))
    }

    /// Unlinks the block holding a large chunk.
    fn unlink_dedicated(&mut self, block: Block, chunk: Chunk) -> NexusResult<()> {
        let sole = block.header_offset(chunk.data()) == Some(BLOCK_HDR_SZ);
        if !sole || !self.blocks.remove(block) {
            return Err(NexusError::corruption(
                &self.name,
                "large chunk is not the sole occupant of one of this context's blocks",
            ));
        }
        Ok(())
    }

    fn notice(&self, message: &str) {
        self.sink.emit(Severity::Notice, message);
    }

    fn out_of_memory(&self, requested: usize) -> NexusError {
        debug!("Out of memory in \"{}\" on request of {} bytes", self.name, requested);
        NexusError::out_of_memory(requested, &self.name)
    }
}

/// Chunk and block size for a dedicated block serving `size` bytes, or
/// `None` if either overflows.
fn dedicated_block_size(size: usize) -> Option<(usize, usize)> {
    let chunk_size = checked_max_align(size)?;
    let blk_size = chunk_size.checked_add(BLOCK_HDR_SZ + CHUNK_HDR_SZ)?;
    Some((chunk_size, blk_size))
}

impl Drop for AllocSet {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for AllocSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocSet")
            .field("name", &self.name)
            .field("blocks", &self.blocks.len())
            .field("keeper", &self.keeper.map(Block::size))
            .field("free_chunks", &self.freelists.total_chunks())
            .field("next_block_size", &self.next_block_size)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl MemoryContext for AllocSet {
    fn kind(&self) -> ContextKind {
        ContextKind::AllocSet
    }

    fn name(&self) -> &str {
        AllocSet::name(self)
    }

    fn alloc(&mut self, size: usize) -> NexusResult<ChunkPtr> {
        AllocSet::alloc(self, size)
    }

    fn free(&mut self, ptr: ChunkPtr) -> NexusResult<()> {
        AllocSet::free(self, ptr)
    }

    fn realloc(&mut self, ptr: ChunkPtr, new_size: usize) -> NexusResult<ChunkPtr> {
        AllocSet::realloc(self, ptr, new_size)
    }

    fn data(&self, ptr: ChunkPtr) -> NexusResult<&[u8]> {
        AllocSet::data(self, ptr)
    }

    fn data_mut(&mut self, ptr: ChunkPtr) -> NexusResult<&mut [u8]> {
        AllocSet::data_mut(self, ptr)
    }

    fn reset(&mut self) {
        AllocSet::reset(self);
    }

    fn destroy(&mut self) {
        AllocSet::destroy(self);
    }

    fn check(&self) -> usize {
        AllocSet::check(self)
    }

    fn stats(&self) -> MemoryContextStats {
        AllocSet::stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::SystemAllocator;
    use crate::diag::CollectingSink;
    use nexus_common::{ErrorCode, CHUNK_DIRTY, CHUNK_MAGIC};

    fn small_config() -> AllocSetConfig {
        AllocSetConfig::new(0, 1024, 8192)
    }

    fn arena(config: &AllocSetConfig) -> (AllocSet, Arc<SystemAllocator>, Arc<CollectingSink>) {
        let backing = Arc::new(SystemAllocator::new());
        let sink = Arc::new(CollectingSink::new());
        let set = AllocSet::with_parts("test", config, backing.clone(), sink.clone()).unwrap();
        (set, backing, sink)
    }

    #[test]
    fn test_construction_clamps() {
        let (set, _, _) = arena(&AllocSetConfig::new(0, 100, 50));
        assert_eq!(set.init_block_size(), ALLOC_MIN_BLOCK_SIZE);
        assert_eq!(set.max_block_size(), ALLOC_MIN_BLOCK_SIZE);
        assert_eq!(set.next_block_size(), ALLOC_MIN_BLOCK_SIZE);
        assert!(!set.has_keeper());
        assert_eq!(set.block_count(), 0);

        let (set, _, _) = arena(&AllocSetConfig::new(0, 2000, 5000));
        assert_eq!(set.init_block_size(), 2000);
        assert_eq!(set.max_block_size(), 5008);
    }

    #[test]
    fn test_keeper_block() {
        let (set, backing, _) = arena(&AllocSetConfig::default());
        assert!(set.has_keeper());
        assert_eq!(set.block_sizes(), vec![8192]);
        assert_eq!(backing.bytes_allocated(), 8192);

        // Too small to hold a chunk: no keeper
        let (set, _, _) = arena(&AllocSetConfig::new(64, 1024, 8192));
        assert!(!set.has_keeper());
    }

    #[test]
    fn test_alloc_is_zeroed_and_aligned() {
        let (mut set, _, _) = arena(&small_config());

        for size in [0, 1, 15, 16, 17, 100, 1000, 8192, 9000] {
            let ptr = set.alloc(size).unwrap();
            assert_eq!(ptr.addr() % MAXIMUM_ALIGNOF, 0);
            assert_eq!(set.requested_size(ptr).unwrap(), size);
            assert!(set.data(ptr).unwrap().iter().all(|&b| b == 0));
        }
        assert_eq!(set.check(), 0);
    }

    #[test]
    fn test_capacity_is_size_class() {
        let (mut set, _, _) = arena(&small_config());

        let p = set.alloc(0).unwrap();
        assert_eq!(set.chunk_capacity(p).unwrap(), 16);
        let p = set.alloc(40).unwrap();
        assert_eq!(set.chunk_capacity(p).unwrap(), 64);
        let p = set.alloc(8192).unwrap();
        assert_eq!(set.chunk_capacity(p).unwrap(), 8192);
        let p = set.alloc(8193).unwrap();
        assert_eq!(set.chunk_capacity(p).unwrap(), 8208);
    }

    #[test]
    fn test_freelist_reuse() {
        let (mut set, _, _) = arena(&small_config());

        let a = set.alloc(40).unwrap();
        set.free(a).unwrap();
        assert_eq!(set.freelist_len(free_index(40)), 1);

        let b = set.alloc(50).unwrap();
        assert_eq!(a, b);
        assert_eq!(set.free_chunk_count(), 0);
        assert!(set.data(b).unwrap().iter().all(|&x| x == 0));
    }

    #[test]
    fn test_free_poisons() {
        let (mut set, _, _) = arena(&small_config());

        let p = set.alloc(40).unwrap();
        set.data_mut(p).unwrap().fill(0xAB);
        set.free(p).unwrap();

        // SAFETY: the chunk is on a freelist inside a live block
        let raw = unsafe { std::slice::from_raw_parts(p.as_ptr(), 64) };
        assert_eq!(raw[0], CHUNK_MAGIC);
        assert!(raw[1..].iter().all(|&b| b == CHUNK_DIRTY));
    }

    #[test]
    fn test_remainder_is_carved() {
        let (mut set, _, _) = arena(&small_config());

        // 992 data bytes: three 256-byte chunks (3 * 288 = 864) leave 128
        for _ in 0..3 {
            set.alloc(256).unwrap();
        }
        assert_eq!(set.free_chunk_count(), 0);

        // Does not fit: the 128-byte tail becomes one 64-byte chunk, and the
        // remaining 32 bytes are too small for anything
        set.alloc(256).unwrap();
        assert_eq!(set.block_count(), 2);
        assert_eq!(set.freelist_len(free_index(64)), 1);
        assert_eq!(set.free_chunk_count(), 1);
        assert_eq!(set.check(), 0);

        // The carved chunk is handed out for the next fitting request
        set.alloc(64).unwrap();
        assert_eq!(set.free_chunk_count(), 0);
    }

    #[test]
    fn test_block_growth_and_reset() {
        let (mut set, _, _) = arena(&small_config());

        for _ in 0..200 {
            set.alloc(200).unwrap();
        }
        let sizes = set.block_sizes();
        assert!(sizes.contains(&1024));
        assert!(sizes.contains(&2048));
        assert!(sizes.contains(&4096));
        assert!(sizes.contains(&8192));
        assert!(sizes.iter().all(|&s| s <= 8192));
        assert_eq!(set.next_block_size(), 8192);

        set.reset();
        assert_eq!(set.block_count(), 0);
        assert_eq!(set.next_block_size(), 1024);

        set.alloc(10).unwrap();
        assert_eq!(set.block_sizes(), vec![1024]);
    }

    #[test]
    fn test_oversized_class_request_gets_exact_block() {
        let (mut set, _, _) = arena(&AllocSetConfig::new(0, 1024, 1024));

        set.alloc(8192).unwrap();
        assert_eq!(
            set.block_sizes(),
            vec![BLOCK_HDR_SZ + CHUNK_HDR_SZ + 8192]
        );
    }

    #[test]
    fn test_large_chunk_round_trip() {
        let (mut set, backing, _) = arena(&small_config());
        set.alloc(10).unwrap();
        let before = backing.bytes_allocated();

        let p = set.alloc(9000).unwrap();
        assert_eq!(set.block_count(), 2);
        // The small block stays at the head
        assert_eq!(set.block_sizes()[0], 1024);

        set.free(p).unwrap();
        assert_eq!(set.block_count(), 1);
        assert_eq!(backing.bytes_allocated(), before);
        assert_eq!(set.free_chunk_count(), 0);
    }

    #[test]
    fn test_realloc_in_place() {
        let (mut set, _, _) = arena(&small_config());

        let p = set.alloc(40).unwrap();
        set.data_mut(p).unwrap().copy_from_slice(&[9u8; 40]);

        let q = set.realloc(p, 30).unwrap();
        assert_eq!(p, q);
        assert_eq!(set.requested_size(q).unwrap(), 30);

        // Grow back within capacity: the reexposed bytes are zero
        let q = set.realloc(q, 60).unwrap();
        assert_eq!(p, q);
        let data = set.data(q).unwrap();
        assert!(data[..30].iter().all(|&b| b == 9));
        assert!(data[30..].iter().all(|&b| b == 0));
        assert_eq!(set.check(), 0);
    }

    #[test]
    fn test_realloc_moves_and_copies() {
        let (mut set, _, _) = arena(&small_config());

        let p = set.alloc(40).unwrap();
        let pattern: Vec<u8> = (0..40).collect();
        set.data_mut(p).unwrap().copy_from_slice(&pattern);

        let q = set.realloc(p, 500).unwrap();
        assert_ne!(p, q);
        let data = set.data(q).unwrap();
        assert_eq!(&data[..40], pattern.as_slice());
        assert!(data[40..].iter().all(|&b| b == 0));

        // The old chunk is back on its freelist
        assert_eq!(set.freelist_len(free_index(40)), 1);
        assert!(matches!(set.data(p), Err(NexusError::DoubleFree { .. })));
    }

    #[test]
    fn test_realloc_class_to_large_and_back() {
        let (mut set, _, _) = arena(&small_config());

        let p = set.alloc(100).unwrap();
        set.data_mut(p).unwrap().fill(5);

        let q = set.realloc(p, 20_000).unwrap();
        assert_eq!(set.chunk_capacity(q).unwrap(), 20_000);
        assert!(set.data(q).unwrap()[..100].iter().all(|&b| b == 5));

        let r = set.realloc(q, 50_000).unwrap();
        assert_eq!(set.chunk_capacity(r).unwrap(), 50_000);
        let data = set.data(r).unwrap();
        assert!(data[..100].iter().all(|&b| b == 5));
        assert!(data[100..].iter().all(|&b| b == 0));
        assert_eq!(set.check(), 0);

        // Shrinking keeps the dedicated block
        let s = set.realloc(r, 10).unwrap();
        assert_eq!(r, s);
        assert_eq!(set.chunk_capacity(s).unwrap(), 50_000);
        assert_eq!(set.check(), 0);

        set.free(s).unwrap();
    }

    #[test]
    fn test_double_free() {
        let (mut set, _, _) = arena(&small_config());

        let p = set.alloc(40).unwrap();
        set.free(p).unwrap();

        let err = set.free(p).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DoubleFree);
        assert!(err.is_misuse());
        assert!(set.realloc(p, 10).is_err());
    }

    #[test]
    fn test_foreign_chunk() {
        let (mut a, _, _) = arena(&small_config());
        let (mut b, _, _) = arena(&small_config());

        let p = a.alloc(40).unwrap();
        let err = b.free(p).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ChunkNotOwned);
        assert!(b.data(p).is_err());

        // Still intact in its own arena
        a.free(p).unwrap();
    }

    #[test]
    fn test_overrun_detected() {
        let (mut set, _, sink) = arena(&small_config());

        let p = set.alloc(40).unwrap();
        // SAFETY: byte 40 lies inside the 64-byte capacity
        unsafe { *p.as_ptr().add(40) = 0 };

        assert_eq!(set.check(), 1);
        assert_eq!(sink.count(Severity::Notice), 1);

        let err = set.realloc(p, 50).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MemoryCorruption);

        // Free still succeeds and reports again
        set.free(p).unwrap();
        assert_eq!(sink.count(Severity::Notice), 2);
        assert_eq!(set.check(), 0);
    }

    #[test]
    fn test_write_after_free_detected() {
        let (mut set, _, sink) = arena(&small_config());

        let p = set.alloc(40).unwrap();
        set.free(p).unwrap();
        // SAFETY: the chunk still lives inside the arena's block
        unsafe { *p.as_ptr().add(8) = 1 };

        assert_eq!(set.check(), 1);
        let notices = sink.messages_at(Severity::Notice);
        assert!(notices[0].contains("freed chunk"));
    }

    #[test]
    fn test_corrupt_link_detected() {
        let (mut set, _, sink) = arena(&small_config());

        let p = set.alloc(40).unwrap();
        // SAFETY: the link tag is the first word of the chunk header
        unsafe { *p.as_ptr().sub(CHUNK_HDR_SZ).cast::<usize>() = 0xDEAD };

        assert_eq!(set.check(), 1);
        assert!(sink.messages_at(Severity::Notice)[0].contains("bogus link"));

        let err = set.free(p).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MemoryCorruption);
    }

    #[test]
    fn test_bogus_stamp_detected() {
        let (mut set, _, sink) = arena(&small_config());

        let p = set.alloc(40).unwrap();
        // SAFETY: the stamp is the second word of the chunk header
        unsafe { *p.as_ptr().sub(CHUNK_HDR_SZ - 8).cast::<usize>() = usize::MAX };

        assert_eq!(set.check(), 1);
        assert!(sink.messages_at(Severity::Notice)[0].contains("bogus stamp"));
        assert_eq!(set.free(p).unwrap_err().code(), ErrorCode::ChunkNotOwned);
    }

    #[test]
    fn test_stale_handle_after_reset() {
        let (mut set, _, _) = arena(&AllocSetConfig::default());

        let p1 = set.alloc(16).unwrap();
        let p2 = set.alloc(16).unwrap();
        set.reset();

        // The keeper was rewound, so p2 now points past the carved space
        assert_eq!(set.data(p2).unwrap_err().code(), ErrorCode::ChunkNotOwned);

        // q reuses p1's address but not its stamp
        let q = set.alloc(16).unwrap();
        assert_eq!(q.as_ptr(), p1.as_ptr());
        assert_ne!(q, p1);
        assert_eq!(set.data_mut(p1).unwrap_err().code(), ErrorCode::ChunkNotOwned);
        assert_eq!(set.free(p1).unwrap_err().code(), ErrorCode::ChunkNotOwned);
        assert!(set.realloc(p1, 100).is_err());

        set.data_mut(q).unwrap().fill(7);
        assert!(set.data(q).unwrap().iter().all(|&b| b == 7));
        assert_eq!(set.check(), 0);
    }

    #[test]
    fn test_handle_to_released_block() {
        let (mut set, _, _) = arena(&small_config());

        let large = set.alloc(20_000).unwrap();
        let small = set.alloc(40).unwrap();
        set.free(large).unwrap();
        assert_eq!(set.free(large).unwrap_err().code(), ErrorCode::ChunkNotOwned);
        assert_eq!(set.data(large).unwrap_err().code(), ErrorCode::ChunkNotOwned);

        set.reset();
        assert_eq!(set.data(small).unwrap_err().code(), ErrorCode::ChunkNotOwned);
    }

    #[test]
    fn test_oversized_request_is_out_of_memory() {
        let (mut set, _, _) = arena(&small_config());

        let err = set.alloc(usize::MAX - 8).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfMemory);
        assert_eq!(set.block_count(), 0);

        let large = set.alloc(9000).unwrap();
        set.data_mut(large).unwrap().fill(0x42);
        let err = set.realloc(large, usize::MAX - 8).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfMemory);

        // The original chunk is untouched and still owned
        assert!(set.data(large).unwrap().iter().all(|&b| b == 0x42));
        assert_eq!(set.check(), 0);
        set.free(large).unwrap();

        let small = set.alloc(40).unwrap();
        let err = set.realloc(small, usize::MAX).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfMemory);
        set.free(small).unwrap();
    }

    #[test]
    fn test_oversized_config_rejected() {
        let config = AllocSetConfig::new(0, usize::MAX, usize::MAX);
        let err = AllocSet::new("huge", &config).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfig);
    }

    #[test]
    fn test_reset_keeps_keeper() {
        let (mut set, backing, _) = arena(&AllocSetConfig::default());

        for _ in 0..100 {
            set.alloc(500).unwrap();
        }
        set.alloc(20_000).unwrap();
        assert!(set.block_count() > 2);

        set.reset();
        assert_eq!(set.block_sizes(), vec![8192]);
        assert_eq!(set.free_chunk_count(), 0);
        assert_eq!(backing.bytes_allocated(), 8192);

        let stats = set.usage();
        assert_eq!(stats.free_bytes, 8192 - BLOCK_HDR_SZ);

        // The keeper is reused
        set.alloc(100).unwrap();
        assert_eq!(set.block_count(), 1);
    }

    #[test]
    fn test_destroy() {
        let (mut set, backing, _) = arena(&AllocSetConfig::default());
        set.alloc(100).unwrap();

        set.destroy();
        assert!(set.is_destroyed());
        assert_eq!(set.block_count(), 0);
        assert_eq!(backing.bytes_allocated(), 0);

        let err = set.alloc(10).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ContextDestroyed);
        assert_eq!(set.check(), 0);

        // Idempotent
        set.destroy();
        set.reset();
    }

    #[test]
    fn test_drop_releases_everything() {
        let backing = Arc::new(SystemAllocator::new());
        {
            let mut set = AllocSet::with_parts(
                "dropped",
                &AllocSetConfig::default(),
                backing.clone(),
                Arc::new(CollectingSink::new()),
            )
            .unwrap();
            set.alloc(100).unwrap();
            set.alloc(100_000).unwrap();
        }
        assert_eq!(backing.bytes_allocated(), 0);
        assert_eq!(backing.region_count(), 0);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let backing = Arc::new(SystemAllocator::with_limit(4096));
        let mut set = AllocSet::with_parts(
            "limited",
            &small_config(),
            backing.clone(),
            Arc::new(CollectingSink::new()),
        )
        .unwrap();

        let err = set.alloc(9000).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfMemory);
        assert!(err.is_fatal());
        assert!(err.to_string().contains("limited"));

        // The arena is still consistent and usable
        let p = set.alloc(100).unwrap();
        assert_eq!(set.check(), 0);
        set.free(p).unwrap();
    }

    #[test]
    fn test_keeper_exhaustion_fails_construction() {
        let backing = Arc::new(SystemAllocator::with_limit(1024));
        let result = AllocSet::with_parts(
            "keeper",
            &AllocSetConfig::default(),
            backing,
            Arc::new(CollectingSink::new()),
        );
        assert!(matches!(result, Err(NexusError::OutOfMemory { .. })));
    }

    #[test]
    fn test_stats_emitted() {
        let (mut set, _, sink) = arena(&small_config());
        set.alloc(40).unwrap();

        let stats = set.stats();
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.reserved_bytes, 1024);
        assert_eq!(stats.total_bytes, 1024 - BLOCK_HDR_SZ);
        assert_eq!(stats.used_bytes, CHUNK_HDR_SZ + 64);

        let logged = sink.messages_at(Severity::Log);
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0], stats.to_string());
    }
}
