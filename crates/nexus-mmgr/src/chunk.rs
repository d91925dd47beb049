//! Chunk layout.
//!
//! Every chunk is a fixed-size header immediately followed by its data. The
//! pointer handed to callers is the start of the data, so the header is
//! always found at a fixed negative offset from it.
//!
//! ```text
//! ┌──────────────────────────────┬───────────────────────────────────────┐
//! │ ChunkHeader (CHUNK_HDR_SZ)   │ data (size bytes)                     │
//! │  link tag  │ link word       │ requested bytes │ 0x7E │ unused ...   │
//! │  size      │ requested_size  │                                       │
//! └──────────────────────────────┴───────────────────────────────────────┘
//!                                ▲
//!                                └── ChunkPtr
//! ```
//!
//! The link is a tagged union: while the chunk is free it holds the next
//! chunk of the same size class, while it is allocated it holds the stamp
//! of the allocation. An unknown tag means the header was overwritten.
//!
//! Stamps are never reused within the process, and every [`ChunkPtr`] carries
//! the stamp it was issued with. A handle that outlived its allocation
//! therefore no longer matches the header at its address, even when the
//! same bytes were handed out again.

use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

use nexus_common::{CHUNK_DIRTY, CHUNK_MAGIC};

use crate::backing::max_align;

const LINK_FREE: usize = 0x4652_4545;
const LINK_ALLOCATED: usize = 0x414C_4C43;

static NEXT_ARENA_ID: AtomicUsize = AtomicUsize::new(1);
static NEXT_STAMP: AtomicUsize = AtomicUsize::new(1);

/// Process-unique identity of an arena, stored in the blocks it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ArenaId(usize);

impl ArenaId {
    pub(crate) fn next() -> Self {
        Self(NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub(crate) const fn as_usize(self) -> usize {
        self.0
    }
}

/// Process-unique serial number of one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Stamp(usize);

impl Stamp {
    /// Held by chunks that were carved but never handed out.
    pub(crate) const NONE: Self = Self(0);

    pub(crate) fn issue() -> Self {
        Self(NEXT_STAMP.fetch_add(1, Ordering::Relaxed))
    }

    /// Lowest stamp not issued yet.
    pub(crate) fn horizon() -> Self {
        Self(NEXT_STAMP.load(Ordering::Relaxed))
    }

    pub(crate) const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub(crate) const fn as_usize(self) -> usize {
        self.0
    }
}

#[repr(C)]
struct ChunkHeader {
    tag: usize,
    word: usize,
    size: usize,
    requested_size: usize,
}

/// Size of a chunk header, rounded to the maximum alignment.
pub const CHUNK_HDR_SZ: usize = max_align(mem::size_of::<ChunkHeader>());

/// Decoded state of a chunk's link field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChunkLink {
    /// On a freelist; holds the next free chunk of the same class.
    Free(Option<Chunk>),
    /// Handed out under this stamp.
    Allocated(Stamp),
}

/// Opaque handle to the data of an allocated chunk.
///
/// Handles are only produced by arenas. They stay valid until the chunk is
/// freed, moved by a reallocation, or its arena is reset or destroyed.
/// Afterwards every arena operation rejects them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPtr {
    data: NonNull<u8>,
    stamp: Stamp,
}

// SAFETY: a handle is an address; dereferencing it goes through the owning
// arena, which enforces exclusive access.
unsafe impl Send for ChunkPtr {}
unsafe impl Sync for ChunkPtr {}

impl ChunkPtr {
    /// Returns the raw data address.
    ///
    /// Writing through it is only sound within the chunk's requested size
    /// and while the chunk is live.
    #[inline]
    #[must_use]
    pub fn as_ptr(self) -> *mut u8 {
        self.data.as_ptr()
    }

    /// Returns the data address as an integer.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.data.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn stamp(self) -> Stamp {
        self.stamp
    }
}

impl fmt::Debug for ChunkPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkPtr({:p}, #{})", self.data, self.stamp.as_usize())
    }
}

impl fmt::Pointer for ChunkPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.data, f)
    }
}

/// A chunk header inside a live block.
///
/// Values of this type are only created over headers the arena wrote
/// itself, so the accessors below read and write through the pointer
/// without further checks.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Chunk(NonNull<ChunkHeader>);

impl Chunk {
    /// Writes a fresh header at `at` for a chunk of `size` bytes that has
    /// not been handed out yet.
    ///
    /// # Safety
    ///
    /// `at` must be maximally aligned and followed by `CHUNK_HDR_SZ + size`
    /// writable bytes inside a live block.
    pub(crate) unsafe fn init(at: NonNull<u8>, size: usize) -> Self {
        let header = at.cast::<ChunkHeader>();
        // SAFETY: guaranteed by the caller
        unsafe {
            header.as_ptr().write(ChunkHeader {
                tag: LINK_ALLOCATED,
                word: Stamp::NONE.as_usize(),
                size,
                requested_size: 0,
            });
        }
        Self(header)
    }

    /// Reinterprets an existing header.
    ///
    /// # Safety
    ///
    /// `at` must point at a header previously written by [`Chunk::init`]
    /// inside a block that is still live.
    pub(crate) unsafe fn at(at: NonNull<u8>) -> Self {
        Self(at.cast())
    }

    /// Recovers the header from a data handle.
    ///
    /// # Safety
    ///
    /// The `CHUNK_HDR_SZ` bytes before `ptr` must lie inside the used part
    /// of a live block. The header found there may belong to a different
    /// allocation; callers compare stamps before trusting it.
    pub(crate) unsafe fn from_data(ptr: ChunkPtr) -> Self {
        // SAFETY: the header sits CHUNK_HDR_SZ bytes before the data
        unsafe { Self(NonNull::new_unchecked(ptr.as_ptr().sub(CHUNK_HDR_SZ)).cast()) }
    }

    #[inline]
    fn header(&self) -> &ChunkHeader {
        // SAFETY: chunks are only constructed over live headers
        unsafe { self.0.as_ref() }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut ChunkHeader {
        // SAFETY: chunks are only constructed over live headers, and the
        // arena holds no other reference into this header while mutating
        unsafe { self.0.as_mut() }
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    fn data_ptr(self) -> *mut u8 {
        // SAFETY: the data region follows the header inside the same block
        unsafe { self.0.as_ptr().cast::<u8>().add(CHUNK_HDR_SZ) }
    }

    /// Returns the caller-visible handle, carrying the current stamp.
    #[inline]
    pub(crate) fn data(self) -> ChunkPtr {
        let stamp = match self.link() {
            Some(ChunkLink::Allocated(stamp)) => stamp,
            _ => Stamp::NONE,
        };
        ChunkPtr {
            // SAFETY: data_ptr is derived from a non-null header pointer
            data: unsafe { NonNull::new_unchecked(self.data_ptr()) },
            stamp,
        }
    }

    /// Capacity of the data region.
    #[inline]
    pub(crate) fn size(self) -> usize {
        self.header().size
    }

    /// Header plus capacity.
    #[inline]
    pub(crate) fn total_size(self) -> usize {
        CHUNK_HDR_SZ + self.size()
    }

    #[inline]
    pub(crate) fn requested_size(self) -> usize {
        self.header().requested_size
    }

    /// Decodes the link, or `None` if the tag was overwritten.
    pub(crate) fn link(self) -> Option<ChunkLink> {
        let header = self.header();
        match header.tag {
            LINK_FREE => Some(ChunkLink::Free(
                NonNull::new(header.word as *mut ChunkHeader).map(Chunk),
            )),
            LINK_ALLOCATED => Some(ChunkLink::Allocated(Stamp::from_raw(header.word))),
            _ => None,
        }
    }

    pub(crate) fn set_link(mut self, link: ChunkLink) {
        let header = self.header_mut();
        match link {
            ChunkLink::Free(next) => {
                header.tag = LINK_FREE;
                header.word = next.map_or(0, Chunk::addr);
            }
            ChunkLink::Allocated(stamp) => {
                header.tag = LINK_ALLOCATED;
                header.word = stamp.as_usize();
            }
        }
    }

    /// Next chunk on the same freelist, if this chunk is free.
    #[inline]
    pub(crate) fn next_free(self) -> Option<Chunk> {
        match self.link() {
            Some(ChunkLink::Free(next)) => next,
            _ => None,
        }
    }

    /// Updates the capacity after the containing block was resized.
    pub(crate) fn set_size(mut self, size: usize) {
        self.header_mut().size = size;
    }

    /// Records the caller's size and places the boundary marker after it.
    pub(crate) fn set_requested_size(mut self, requested: usize) {
        self.header_mut().requested_size = requested;
        if requested < self.size() {
            // SAFETY: requested < size, so the marker lies inside the data
            unsafe { *self.data_ptr().add(requested) = CHUNK_MAGIC };
        }
    }

    /// Returns false if the byte after the requested size was overwritten.
    pub(crate) fn boundary_intact(self) -> bool {
        let requested = self.requested_size();
        if requested >= self.size() {
            return true;
        }
        // SAFETY: requested < size, so the marker lies inside the data
        unsafe { *self.data_ptr().add(requested) == CHUNK_MAGIC }
    }

    /// Hands the chunk out under `stamp` with `requested` zeroed bytes.
    pub(crate) fn prepare(self, stamp: Stamp, requested: usize) {
        debug_assert!(requested <= self.size());
        self.set_link(ChunkLink::Allocated(stamp));
        // SAFETY: requested <= size
        unsafe { ptr::write_bytes(self.data_ptr(), 0, requested) };
        self.set_requested_size(requested);
    }

    /// Changes the requested size in place, zeroing any newly exposed bytes.
    pub(crate) fn resize_in_place(self, requested: usize) {
        debug_assert!(requested <= self.size());
        let old = self.requested_size();
        if requested > old {
            // SAFETY: old < requested <= size
            unsafe { ptr::write_bytes(self.data_ptr().add(old), 0, requested - old) };
        }
        self.set_requested_size(requested);
    }

    /// Poisons the data region of a chunk that is being freed.
    ///
    /// The poison is written first and the marker last, so a freed chunk
    /// carries the marker at offset 0 and the dirty pattern everywhere else.
    pub(crate) fn clobber(self) {
        // SAFETY: the data region is size bytes long
        unsafe { ptr::write_bytes(self.data_ptr(), CHUNK_DIRTY, self.size()) };
        self.set_requested_size(0);
    }

    /// Returns false if a freed chunk was written to after it was poisoned.
    pub(crate) fn poison_intact(self) -> bool {
        let size = self.size();
        if size <= 1 {
            return true;
        }
        // SAFETY: the data region is size bytes long
        let data = unsafe { slice::from_raw_parts(self.data_ptr(), size) };
        data[1..].iter().all(|&b| b == CHUNK_DIRTY)
    }

    /// The caller-visible bytes.
    ///
    /// # Safety
    ///
    /// The chunk must be allocated, and the returned slice must not outlive
    /// it or alias a mutable view of it.
    pub(crate) unsafe fn bytes<'a>(self) -> &'a [u8] {
        // SAFETY: guaranteed by the caller
        unsafe { slice::from_raw_parts(self.data_ptr(), self.requested_size()) }
    }

    /// The caller-visible bytes, mutably.
    ///
    /// # Safety
    ///
    /// Same contract as [`Chunk::bytes`], and no other view may exist.
    pub(crate) unsafe fn bytes_mut<'a>(self) -> &'a mut [u8] {
        // SAFETY: guaranteed by the caller
        unsafe { slice::from_raw_parts_mut(self.data_ptr(), self.requested_size()) }
    }

    /// Copies `len` caller-visible bytes into another chunk.
    ///
    /// # Safety
    ///
    /// Both chunks must be live and distinct, `len` must not exceed either
    /// requested size.
    pub(crate) unsafe fn copy_to(self, dst: Chunk, len: usize) {
        // SAFETY: guaranteed by the caller
        unsafe { ptr::copy_nonoverlapping(self.data_ptr(), dst.data_ptr(), len) };
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("addr", &self.0)
            .field("size", &self.size())
            .field("requested_size", &self.requested_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A maximally aligned scratch buffer standing in for a block.
    #[repr(C, align(16))]
    struct Scratch([u8; 256]);

    fn chunk_in(scratch: &mut Scratch, size: usize) -> Chunk {
        assert!(CHUNK_HDR_SZ + size <= scratch.0.len());
        let at = NonNull::new(scratch.0.as_mut_ptr()).unwrap();
        unsafe { Chunk::init(at, size) }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(CHUNK_HDR_SZ, 32);
        assert_eq!(CHUNK_HDR_SZ % nexus_common::MAXIMUM_ALIGNOF, 0);
    }

    #[test]
    fn test_arena_ids_are_unique() {
        let a = ArenaId::next();
        let b = ArenaId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_header_recovery() {
        let mut scratch = Scratch([0; 256]);
        let chunk = chunk_in(&mut scratch, 64);

        let data = chunk.data();
        assert_eq!(data.addr() - chunk.addr(), CHUNK_HDR_SZ);
        assert_eq!(unsafe { Chunk::from_data(data) }, chunk);
    }

    #[test]
    fn test_handle_carries_stamp() {
        let mut scratch = Scratch([0; 256]);
        let chunk = chunk_in(&mut scratch, 64);
        assert_eq!(chunk.data().stamp(), Stamp::NONE);

        let stamp = Stamp::issue();
        assert!(stamp > Stamp::NONE);
        assert!(Stamp::horizon() > stamp);
        chunk.prepare(stamp, 8);
        let first = chunk.data();
        assert_eq!(first.stamp(), stamp);

        // Same address handed out again is a different handle
        chunk.clobber();
        chunk.prepare(Stamp::issue(), 8);
        let second = chunk.data();
        assert_eq!(first.addr(), second.addr());
        assert_ne!(first, second);
    }

    #[test]
    fn test_link_states() {
        let mut scratch = Scratch([0; 256]);
        let chunk = chunk_in(&mut scratch, 32);

        assert_eq!(chunk.link(), Some(ChunkLink::Allocated(Stamp::NONE)));
        let stamp = Stamp::issue();
        chunk.prepare(stamp, 0);
        assert_eq!(chunk.link(), Some(ChunkLink::Allocated(stamp)));

        chunk.set_link(ChunkLink::Free(None));
        assert_eq!(chunk.link(), Some(ChunkLink::Free(None)));
        assert_eq!(chunk.next_free(), None);

        // Overwrite the tag
        scratch.0[0] = 0xAB;
        assert_eq!(chunk.link(), None);
    }

    #[test]
    fn test_boundary_marker() {
        let mut scratch = Scratch([0; 256]);
        let chunk = chunk_in(&mut scratch, 64);

        chunk.prepare(Stamp::issue(), 40);
        assert_eq!(chunk.requested_size(), 40);
        assert_eq!(scratch.0[CHUNK_HDR_SZ + 40], CHUNK_MAGIC);
        assert!(chunk.boundary_intact());

        scratch.0[CHUNK_HDR_SZ + 40] = 0;
        assert!(!chunk.boundary_intact());
    }

    #[test]
    fn test_exact_fit_has_no_marker() {
        let mut scratch = Scratch([0; 256]);
        let chunk = chunk_in(&mut scratch, 32);

        chunk.prepare(Stamp::issue(), 32);
        assert!(chunk.boundary_intact());
        assert!(unsafe { chunk.bytes() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_clobber_then_prepare() {
        let mut scratch = Scratch([0; 256]);
        let chunk = chunk_in(&mut scratch, 64);

        chunk.prepare(Stamp::issue(), 64);
        unsafe { chunk.bytes_mut() }.fill(0x11);

        chunk.clobber();
        assert_eq!(chunk.requested_size(), 0);
        assert_eq!(scratch.0[CHUNK_HDR_SZ], CHUNK_MAGIC);
        assert!(chunk.boundary_intact());
        assert!(chunk.poison_intact());

        scratch.0[CHUNK_HDR_SZ + 10] = 0;
        assert!(!chunk.poison_intact());

        chunk.prepare(Stamp::issue(), 48);
        assert!(unsafe { chunk.bytes() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_resize_in_place_zeroes_growth() {
        let mut scratch = Scratch([0; 256]);
        let chunk = chunk_in(&mut scratch, 64);

        chunk.prepare(Stamp::issue(), 16);
        unsafe { chunk.bytes_mut() }.fill(0xAA);

        chunk.resize_in_place(8);
        assert_eq!(scratch.0[CHUNK_HDR_SZ + 8], CHUNK_MAGIC);

        chunk.resize_in_place(32);
        let bytes = unsafe { chunk.bytes() };
        assert!(bytes[..8].iter().all(|&b| b == 0xAA));
        assert!(bytes[8..].iter().all(|&b| b == 0));
        assert!(chunk.boundary_intact());
    }
}
