//! System-wide constants for the NexusDB memory manager.
//!
//! These values fix the physical layout of arena blocks and chunks. Changing
//! any of them changes the size-class boundaries, so they are shared from
//! here rather than redefined per crate.

// =============================================================================
// Alignment
// =============================================================================

/// Alignment of every block header, chunk header and chunk data region.
///
/// 16 bytes is enough for every primitive type on currently supported
/// targets, and is what `max_align_t` is on x86_64 and aarch64.
pub const MAXIMUM_ALIGNOF: usize = 16;

// =============================================================================
// Size Classes
// =============================================================================

/// Log2 of the smallest chunk size. The smallest chunk holds 16 bytes.
///
/// `1 << ALLOC_MIN_BITS` must be at least `MAXIMUM_ALIGNOF`, otherwise the
/// smallest chunks would not be adequately aligned.
pub const ALLOC_MIN_BITS: u32 = 4;

/// Number of power-of-two freelists kept by every arena.
///
/// Freelist `k` holds chunks of `1 << (k + ALLOC_MIN_BITS)` bytes.
pub const ALLOC_NUM_FREELISTS: usize = 10;

/// Largest request served from the size-class freelists (8 KB).
///
/// Anything bigger gets a dedicated block that goes straight back to the
/// backing allocator when freed.
pub const ALLOC_CHUNK_LIMIT: usize = 1 << (ALLOC_NUM_FREELISTS as u32 - 1 + ALLOC_MIN_BITS);

/// Smallest initial block size an arena will accept (1 KB).
pub const ALLOC_MIN_BLOCK_SIZE: usize = 1024;

// =============================================================================
// Debugging Patterns
// =============================================================================

/// Sentinel byte written just past the requested size of a chunk.
pub const CHUNK_MAGIC: u8 = 0x7E;

/// Byte pattern a chunk's data is overwritten with when it is freed.
pub const CHUNK_DIRTY: u8 = 0x7F;

// =============================================================================
// Arena Presets
// =============================================================================

/// Default keeper block size for general purpose contexts (8 KB).
pub const ALLOCSET_DEFAULT_MINSIZE: usize = 8 * 1024;

/// Default first block size for general purpose contexts (8 KB).
pub const ALLOCSET_DEFAULT_INITSIZE: usize = 8 * 1024;

/// Default block size cap for general purpose contexts (8 MB).
pub const ALLOCSET_DEFAULT_MAXSIZE: usize = 8 * 1024 * 1024;

/// Keeper size for contexts expected to hold little data (no keeper).
pub const ALLOCSET_SMALL_MINSIZE: usize = 0;

/// First block size for small contexts (1 KB).
pub const ALLOCSET_SMALL_INITSIZE: usize = 1024;

/// Block size cap for small contexts (8 KB).
pub const ALLOCSET_SMALL_MAXSIZE: usize = 8 * 1024;
